use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::RequestKind;

pub const NOT_CONNECTED_MESSAGE: &str = "dApp not connected";
pub const USER_REJECTED_MESSAGE: &str = "User rejected request";
pub const SURFACE_CLOSED_MESSAGE: &str = "User closed popup";
pub const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    NotConnected,
    UserRejected,
    SurfaceAbandoned,
    Timeout,
    NotImplemented,
    Unknown,
}

/// Terminal failure of a request, as carried in a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct WalletError {
    pub code: ErrorCode,
    pub message: String,
}

impl WalletError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn not_connected() -> Self {
        Self::new(ErrorCode::NotConnected, NOT_CONNECTED_MESSAGE)
    }

    /// Explicit decline; the approval surface may supply a more specific reason.
    pub fn user_rejected(reason: Option<String>) -> Self {
        let message = reason
            .filter(|reason| !reason.trim().is_empty())
            .unwrap_or_else(|| USER_REJECTED_MESSAGE.to_string());
        Self::new(ErrorCode::UserRejected, message)
    }

    pub fn surface_abandoned() -> Self {
        Self::new(ErrorCode::SurfaceAbandoned, SURFACE_CLOSED_MESSAGE)
    }

    pub fn timeout(kind: RequestKind) -> Self {
        Self::new(ErrorCode::Timeout, format!("{} request timeout", kind.label()))
    }

    pub fn not_implemented(kind: RequestKind) -> Self {
        Self::new(
            ErrorCode::NotImplemented,
            format!("{} is not implemented", kind.label()),
        )
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unknown, message)
    }

    /// Rebuilds the error carried by a failed response. Missing pieces fall back to
    /// `Unknown` / "Unknown error".
    pub fn from_wire(code: Option<ErrorCode>, message: Option<String>) -> Self {
        Self::new(
            code.unwrap_or(ErrorCode::Unknown),
            message.unwrap_or_else(|| UNKNOWN_ERROR_MESSAGE.to_string()),
        )
    }
}

