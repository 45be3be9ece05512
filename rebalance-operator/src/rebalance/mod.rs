pub mod engine;
pub mod state_machine;

pub use engine::{
    EngineConnector, EngineHandle, JobPhase, JobStatus, MembersInUseChecker, OptimizationEngine,
    ProposalPhase, ProposalRequest, ProposalResponse,
};
pub use state_machine::{RebalanceStateMachine, Transition};
