use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("unexpected HTTP status {status}")]
    Status { status: u16 },

    #[error("response body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("weather API key is not configured")]
    MissingApiKey,

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("weather response missing required field `{0}`")]
    MissingField(&'static str),
}

#[derive(Debug, Error)]
pub enum OtaError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("malformed check-in response: {0}")]
    Malformed(String),

    #[error("firmware upgrade is not supported on this platform")]
    Unsupported,

    #[error("download failed: {0}")]
    Download(String),

    #[error("failed to write image: {0}")]
    Flash(String),
}

/// Rejected structured server message; the message is dropped as a whole.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("message is missing a string `type`")]
    MissingType,

    #[error("`{kind}` message is missing string field `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("unknown tts state `{0}`")]
    UnknownTtsState(String),

    #[error("unknown system command `{0}`")]
    UnknownSystemCommand(String),

    #[error("`{0}` message payload must be an object")]
    PayloadNotObject(&'static str),

    #[error("unknown message type `{0}`")]
    UnknownType(String),
}

#[derive(Debug, Error)]
#[error("settings store `{namespace}` failed: {message}")]
pub struct SettingsError {
    pub namespace: String,
    pub message: String,
}
