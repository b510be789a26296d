use thiserror::Error;
use crate::discovery::DiscoveryState;
use crate::transport::BindError;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("operation not allowed while discovery is {0:?}")]
    InvalidState(DiscoveryState),

    /// The role was never started, e.g. the multicast join failed
    #[error("{0} role is not running")]
    RoleUnavailable(&'static str),

    #[error("invalid discovery config: {0}")]
    InvalidConfig(String),

    #[error("{0} role task has exited")]
    ChannelClosed(&'static str),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = DiscoveryError> = std::result::Result<T, E>;
