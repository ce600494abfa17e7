// ============================
// crates/backend-lib/src/error.rs
// ============================
//! Central error type for the coordination layer.
use crate::store::StoreError;
use thiserror::Error;

/// How an error affects the session that triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Reported to the caller as an `error` message; the connection stays open.
    Recoverable,
    /// The connection is closed with the error message as the close reason.
    Fatal,
}

/// Application error types with wire codes and severity
#[derive(Error, Debug)]
pub enum AppError {
    #[error("missing coordinate")]
    MissingCoordinate,

    #[error("invalid latitude: {0}")]
    InvalidLatitude(f64),

    #[error("invalid longitude: {0}")]
    InvalidLongitude(f64),

    #[error("invalid room code: {0}")]
    InvalidRoomCode(String),

    #[error("room not found")]
    RoomNotFound,

    #[error("already in a room")]
    AlreadyInRoom,

    #[error("not in a room")]
    NotInRoom,

    #[error("room code allocation exhausted after {attempts} attempts")]
    RoomAllocationExhausted { attempts: u32 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Get the wire code for this error
    pub fn code(&self) -> &'static str {
        match self {
            AppError::MissingCoordinate => "MISSING_COORDINATE",
            AppError::InvalidLatitude(_) => "INVALID_LATITUDE",
            AppError::InvalidLongitude(_) => "INVALID_LONGITUDE",
            AppError::InvalidRoomCode(_) => "INVALID_ROOM_CODE",
            AppError::RoomNotFound => "ROOM_NOT_FOUND",
            AppError::AlreadyInRoom => "ALREADY_IN_ROOM",
            AppError::NotInRoom => "NOT_IN_ROOM",
            AppError::RoomAllocationExhausted { .. } => "ROOM_ALLOCATION_EXHAUSTED",
            AppError::Store(_) => "STORE_ERROR",
            AppError::Json(_) => "JSON_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the session survives this error.
    ///
    /// Validation and state errors are reported and the connection stays
    /// open. A failed store transaction committed nothing, so the caller
    /// may retry the whole operation. Only internal invariant breaks
    /// fail the session, never the process.
    pub fn severity(&self) -> Severity {
        match self {
            AppError::Internal(_) => Severity::Fatal,
            _ => Severity::Recoverable,
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for AppError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        AppError::Internal("failed to send message".to_string())
    }
}
