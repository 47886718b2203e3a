#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("wire message error: {0}")]
    Wire(#[from] serde_json::Error),

    /// A pending request was looked up as present but its handler was gone at
    /// invocation time. Indicates protocol desynchronization, there is no local
    /// recovery.
    #[error("response handler for command id \"{0}\" vanished before invocation")]
    CorrelationDefect(String),

    #[error("connection closed before a reply arrived")]
    ConnectionClosed,

    #[error("source encoding \"{0}\" is not supported by the decoder")]
    UnsupportedEncoding(String),

    #[error("encoding choice failed: {0}")]
    EncodingChoice(anyhow::Error),
}
