use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    #[error("terminated fifo")]
    TerminatedFifo,

    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("join error: {0}")]
    Join(String),

    #[error("sort error: {0}")]
    Sort(String),

    #[error("memory error: {0}")]
    Memory(String),
}

pub type Result<T> = std::result::Result<T, FlowError>;
