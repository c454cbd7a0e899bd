//! Typed error hierarchy for every fallible collaborator boundary.
//!
//! Mirrors the error taxonomy in the spec: configuration failures abort
//! startup, codec failures become a 400 response, pool failures are a
//! caller concern, and reactor failures are either fatal-io (close the
//! connection) or configuration (abort startup).

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("port {0} outside the allowed range 1024-65535")]
    PortOutOfRange(u16),
    #[error("thread-num must be >= 1")]
    ZeroThreads,
    #[error("trig-mode must be 0-3, got {0}")]
    InvalidTrigMode(u8),
    #[error("max-connections must be >= 1")]
    ZeroMaxConnections,
    #[error("db-pool-size must be >= 1 when database support is enabled")]
    ZeroDbPoolSize,
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("unsupported method {0}")]
    UnsupportedMethod(String),
    #[error("request missing terminating CRLFCRLF")]
    Incomplete,
    #[error("failed to read response body: {0}")]
    Body(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("database pool closed")]
    Closed,
    #[error("failed to open database handle: {0}")]
    Open(String),
}

#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("socket setup failed: {0}")]
    Socket(#[source] io::Error),
    #[error("epoll operation failed: {0}")]
    Epoll(#[source] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
