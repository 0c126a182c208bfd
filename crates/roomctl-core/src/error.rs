use thiserror::Error;

/// Domain-level failures. Transport failures from `roomctl-api` are
/// wrapped via [`From`] the same way the teacher wraps its own API crate's
/// error into its core error.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("controller is not provisioned")]
    NotProvisioned,

    #[error("client not initialized: call connect first")]
    ClientNotInitialized,

    #[error("operation requires the system device")]
    NotSystemDevice,

    #[error("unknown or non-custom state: {0}")]
    InvalidState(String),

    #[error("unknown command: {0}")]
    InvalidCommand(String),

    #[error("connection failure")]
    ConnectionFailure,

    #[error("controller is disconnected")]
    ControllerDisconnected,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("transport error: {0}")]
    Api(#[from] roomctl_api::Error),
}

impl CoreError {
    /// Whether this failure reflects a dropped/disconnected session as
    /// opposed to a caller mistake (bad state key, wrong command, …).
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::ControllerDisconnected | Self::ConnectionFailure
        ) || matches!(self, Self::Api(err) if err.is_transient())
    }
}
