use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Main relay error type
#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Upstream reported a failed generation during the {phase} phase{}", detail_suffix(.detail))]
    UpstreamGeneration {
        phase: &'static str,
        detail: Option<String>,
    },

    #[error("Failed to fetch generated image {filename}")]
    AssetFetch {
        filename: String,
        #[source]
        source: AssetFetchError,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(detail) => format!(": {detail}"),
        None => String::new(),
    }
}

/// Failure to open the queue websocket
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Failed to connect to {url}")]
    Dial {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("Handshake with {url} rejected (status {status}): {body}")]
    Rejected {
        url: String,
        status: u16,
        body: String,
    },
}

/// Mid-stream websocket failures
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection is not open")]
    NotConnected,

    #[error("Websocket read failed")]
    Read(#[source] tungstenite::Error),

    #[error("Websocket write failed")]
    Write(#[source] tungstenite::Error),

    #[error("Connection closed by remote")]
    Closed,

    #[error("Outbound queue closed before the phase finished")]
    SenderGone,

    #[error("Send task failed")]
    SendTask(#[source] tokio::task::JoinError),
}

/// Malformed or unexpected server packets
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed server packet")]
    Malformed(#[source] serde_json::Error),

    #[error("Completion packet is missing the success flag")]
    MissingSuccessFlag,

    #[error("No output block found in received packet")]
    NoOutput,

    #[error("Output block has no data")]
    EmptyData,

    #[error("Unexpected output shape: {message}")]
    UnexpectedShape { message: String },

    #[error("Transcript does not contain the bot token")]
    MissingBotToken,

    #[error("Upstream did not provide any generated images")]
    NoImages,

    #[error("Failed to encode client reply")]
    Encode(#[source] serde_json::Error),
}

/// Image download failures
#[derive(Error, Debug)]
pub enum AssetFetchError {
    #[error("HTTP request failed")]
    Request(#[from] reqwest::Error),

    #[error("File server returned status {status}")]
    Status { status: u16 },
}

/// Result type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Render an error and all of its sources on one line, for logging.
pub fn format_error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
