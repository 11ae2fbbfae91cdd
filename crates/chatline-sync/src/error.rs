use chatline_core::wire::FrameError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("websocket is not connected")]
    NotConnected,
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}
