use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] coordination_store::error::Error),

    /// Missing or unresolvable auto-rebalance configuration.
    #[error("{0}")]
    Configuration(String),

    /// A request that cannot be sent to the engine as it stands.
    #[error("{0}")]
    Validation(String),

    #[error("member id allocation conflict: {0}")]
    AllocationConflict(String),

    #[error("invalid member id list {input:?}: {reason}")]
    InvalidIdRange { input: String, reason: String },

    /// Transport or protocol failure talking to the optimization engine.
    #[error("optimization engine error: {0}")]
    Engine(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A compare-and-swap write lost against a concurrent writer.
    #[error("concurrent modification of {0}")]
    Conflict(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(e.into())
    }
}

impl From<etcd_client::Error> for Error {
    fn from(e: etcd_client::Error) -> Self {
        Self::Store(e.into())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Engine(e.to_string())
    }
}

impl Error {
    /// Short label used for the `error` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Store(_) => "store",
            Error::Configuration(_) => "configuration",
            Error::Validation(_) => "validation",
            Error::AllocationConflict(_) => "allocation_conflict",
            Error::InvalidIdRange { .. } => "invalid_id_range",
            Error::Engine(_) => "engine",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
