//! Readiness-driven, single-process HTTP/1.1 server core: an epoll-backed
//! reactor, a min-heap idle-connection reaper, and a fixed worker pool.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod conn;
pub mod db;
pub mod epoll;
pub mod error;
pub mod logging;
pub mod pool;
pub mod reactor;
pub mod timer;

pub use config::{Args, Config};
pub use reactor::Reactor;
