use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node '{0}' not found")]
    NotFound(String),

    #[error("persisting state: {0}")]
    Persist(String),
}

/// Parent-chain problems. Abort only the operation that hit them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("parent '{parent}' of node '{node}' not found")]
    ParentNotFound { node: String, parent: String },

    #[error("cyclic parent chain through node '{0}'")]
    Cycle(String),

    #[error("guest '{0}' has no parent host")]
    NoParent(String),

    #[error("parent '{parent}' of guest '{node}' is not a hypervisor host with valid credentials")]
    InvalidHost { node: String, parent: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("connectivity: {0}")]
    Connectivity(String),

    #[error("authentication: {0}")]
    Authentication(String),

    #[error("actuation failed: {0}")]
    Actuation(String),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("{0}")]
    Rejected(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type EngineResult<T> = Result<T, EngineError>;
