// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The terminal outcome of a logical call.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The category of a call's terminal [`Status`]. Callers branch on the code, so handlers should
/// pick the most specific one that applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    /// The call completed successfully.
    Ok,
    /// The request was malformed, e.g. an identifier that could not be parsed.
    InvalidArgument,
    /// The handler found no matching entity.
    NotFound,
    /// A codec or storage failure.
    Internal,
    /// The call's deadline elapsed before it completed.
    DeadlineExceeded,
    /// The call was canceled by the caller or by its context.
    Canceled,
    /// An uncategorized failure.
    Unknown,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Code::Ok => "OK",
            Code::InvalidArgument => "InvalidArgument",
            Code::NotFound => "NotFound",
            Code::Internal => "Internal",
            Code::DeadlineExceeded => "DeadlineExceeded",
            Code::Canceled => "Canceled",
            Code::Unknown => "Unknown",
        })
    }
}

/// The single final outcome of a logical call. Exactly one status is recorded per call, and both
/// the client and the server observe the same one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    /// Returns a status with the given code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Returns an OK status with an empty message.
    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    /// Returns an [`InvalidArgument`](Code::InvalidArgument) status.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    /// Returns a [`NotFound`](Code::NotFound) status.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    /// Returns an [`Internal`](Code::Internal) status.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// Returns a [`DeadlineExceeded`](Code::DeadlineExceeded) status.
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    /// Returns a [`Canceled`](Code::Canceled) status.
    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(Code::Canceled, message)
    }

    /// Returns an [`Unknown`](Code::Unknown) status.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Code::Unknown, message)
    }

    /// The status code.
    pub fn code(&self) -> Code {
        self.code
    }

    /// A human-readable description of the outcome.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true iff the code is [`Code::Ok`].
    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

/// An error returned by the operations of a call adapter.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// The local sending direction of the call was already closed.
    #[error("the sending direction of the call is already closed")]
    InvalidState,
    /// The call terminated with a non-OK status.
    #[error(transparent)]
    Status(#[from] Status),
}

impl RpcError {
    /// Returns the terminal status code, if the error carries one.
    pub fn code(&self) -> Option<Code> {
        match self {
            RpcError::InvalidState => None,
            RpcError::Status(status) => Some(status.code()),
        }
    }

    /// Returns the terminal status, if the error carries one.
    pub fn status(&self) -> Option<&Status> {
        match self {
            RpcError::InvalidState => None,
            RpcError::Status(status) => Some(status),
        }
    }
}

impl From<RpcError> for Status {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::InvalidState => Status::internal(RpcError::InvalidState.to_string()),
            RpcError::Status(status) => status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Code, RpcError, Status};

    #[test]
    fn display_includes_code_and_message() {
        let status = Status::not_found("no blog with id 42");
        assert_eq!(status.to_string(), "NotFound: no blog with id 42");
    }

    #[test]
    fn rpc_error_code() {
        assert_eq!(RpcError::InvalidState.code(), None);
        assert_eq!(
            RpcError::from(Status::canceled("bye")).code(),
            Some(Code::Canceled)
        );
    }
}
