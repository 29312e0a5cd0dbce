use thiserror::Error;

/// Radio link failures. Never fatal once the link is open: the next poll
/// cycle simply tries again.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial link is not open")]
    NotOpen,
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("serial link i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("radio link thread stopped")]
    Stopped,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("frame has {found} fields, at least {expected} required")]
    MissingFields { expected: usize, found: usize },
    #[error("malformed frame header {0:?}")]
    MalformedHeader(String),
    #[error("field `{field}` is not numeric: {value:?}")]
    NotNumeric { field: &'static str, value: String },
    #[error("unknown action {0:?}")]
    UnknownAction(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("admin key mismatch (session {session_id:?})")]
pub struct AuthError {
    pub session_id: Option<i64>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("mqtt connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("failed to encode relay message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("undecodable relay payload: {0}")]
    Decode(String),
    #[error("timed out connecting to the relay broker")]
    ConnectTimeout,
}

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("id allocation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("id allocator returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("id allocator response has no assigned_id")]
    MissingId,
    #[error("no id allocator configured")]
    Unconfigured,
}
