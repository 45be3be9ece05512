pub mod error;
pub mod leader_election;
pub mod store;
pub mod util;

pub use store::{EtcdStore, StoreConfig, Versioned};
