use thiserror::Error;

/// Transport-level failures surfaced by the REST and message-channel clients.
///
/// Nothing in this crate panics or throws out of an async fn on a remote
/// failure; every fallible operation returns this type as a value.
#[derive(Debug, Error)]
pub enum Error {
    #[error("request was rejected: unauthorized (403)")]
    Unauthorized,

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("response could not be decoded as json: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("server returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("message channel is not open")]
    ChannelNotOpen,

    #[error("websocket connection failed: {0}")]
    WebSocketConnect(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("websocket connection closed")]
    WebSocketClosed,
}

impl Error {
    /// Whether this error represents a transient condition worth retrying
    /// (5xx, timeout, or a raw transport hiccup) as opposed to something
    /// the caller must act on (403, decode failure, bad url).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) | Self::WebSocketClosed => true,
            Self::Status { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }
}
