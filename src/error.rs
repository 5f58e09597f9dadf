use crate::market::types::SeriesKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json encode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("float parse error: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error("frame parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("history fetch for {key} failed: {source}")]
    Backfill {
        key: SeriesKey,
        #[source]
        source: Box<SyncError>,
    },
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

/// Reasons a stream frame could not be turned into a canonical record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("payload is not valid json: {0}")]
    InvalidJson(String),
    #[error("frame is not a ticker, candle, or subscription ack")]
    UnrecognizedFrame,
    #[error("required field '{0}' is missing")]
    MissingField(&'static str),
    #[error("unknown candle interval '{0}'")]
    UnknownInterval(String),
}
