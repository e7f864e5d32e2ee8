//! Structured error types for each layer of the server, per the error-handling
//! design: transport errors close the offending connection; PTY lifecycle
//! errors are returned to the requesting client; everything else propagates
//! to `main` via `anyhow`.

use thiserror::Error;

/// Errors from the wire codec (`src/codec.rs`). Pure, no I/O.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid message format")]
    InvalidMessageFormat,
    #[error("invalid message type: {0}")]
    InvalidMessageType(i64),
    #[error("invalid array length: {0}")]
    InvalidArrayLength(usize),
    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: &'static str, got: &'static str },
}

/// Errors from PTY lifecycle operations (fork, openpty, exec, resize).
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenFailed(#[source] nix::Error),
    #[error("fork failed: {0}")]
    ForkFailed(#[source] nix::Error),
    #[error("exec failed: {0}")]
    ExecFailed(#[source] nix::Error),
    #[error("resize failed: {0}")]
    ResizeFailed(#[source] nix::Error),
    #[error("pty {0} not found")]
    NotFound(u64),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned to a client as the `error` field of an RPC response.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("pty not found: {0}")]
    PtyNotFound(u64),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("client is not attached to anything")]
    NotAttached,
    #[error(transparent)]
    Pty(#[from] PtyError),
    #[error("invalid params: {0}")]
    InvalidParams(String),
}
