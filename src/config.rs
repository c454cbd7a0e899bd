//! CLI-driven configuration: a `clap`-derived [`Args`] mirroring every
//! option in spec §6, validated into an immutable [`Config`].

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::epoll::Interest;
use crate::error::ConfigError;

/// Default upper bound on simultaneously live connections (spec §3),
/// overridable via `--max-connections` so capacity-overflow behavior can
/// be exercised without opening tens of thousands of sockets.
pub const DEFAULT_MAX_CONNECTIONS: usize = 65_536;

/// Listener backlog, matching the original server's fixed constant.
pub const LISTEN_BACKLOG: i32 = 6;

#[derive(Parser, Debug, Clone)]
#[command(name = "reactor-httpd", about = "Readiness-driven HTTP/1.1 reactor core")]
pub struct Args {
    /// Listener TCP port (1024-65535).
    #[arg(long, default_value_t = 1316)]
    pub port: u16,

    /// 0 neither / 1 conn-ET / 2 listen-ET / 3 both ET.
    #[arg(long = "trig-mode", default_value_t = 3)]
    pub trig_mode: u8,

    /// Per-connection idle expiry in milliseconds; 0 disables the reaper.
    #[arg(long = "timeout-ms", default_value_t = 60_000)]
    pub timeout_ms: u64,

    /// Set SO_LINGER(on=1, linger=1) on accepted sockets for graceful close.
    #[arg(long = "opt-linger", default_value_t = false)]
    pub opt_linger: bool,

    /// Number of pre-opened database handles.
    #[arg(long = "db-pool-size", default_value_t = 4)]
    pub db_pool_size: usize,

    /// Worker thread count (>= 1).
    #[arg(long = "thread-num", default_value_t = 6)]
    pub thread_num: usize,

    /// Directory served as the static document root.
    #[arg(long = "src-dir", default_value = "resources")]
    pub src_dir: PathBuf,

    /// Minimum tracing level (trace/debug/info/warn/error).
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Optional on-disk directory for a rolling log sink; stdout if unset.
    #[arg(long = "log-dir")]
    pub log_dir: Option<PathBuf>,

    /// Bounded channel depth of the non-blocking log writer.
    #[arg(long = "log-queue-size", default_value_t = 1024)]
    pub log_queue_size: usize,

    /// Upper bound on simultaneously live connections.
    #[arg(long = "max-connections", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,
}

impl Args {
    pub fn into_config(self) -> Result<Config, ConfigError> {
        if !(1024..=65535).contains(&self.port) {
            return Err(ConfigError::PortOutOfRange(self.port));
        }
        if self.thread_num == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if self.trig_mode > 3 {
            return Err(ConfigError::InvalidTrigMode(self.trig_mode));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroMaxConnections);
        }

        let (listen_interest, conn_interest) = trigger_masks(self.trig_mode);

        Ok(Config {
            port: self.port,
            listen_interest,
            conn_interest,
            idle_timeout: (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms)),
            opt_linger: self.opt_linger,
            db_pool_size: self.db_pool_size,
            thread_num: self.thread_num,
            src_dir: self.src_dir,
            log_level: self.log_level,
            log_dir: self.log_dir,
            log_queue_size: self.log_queue_size,
            max_connections: self.max_connections,
        })
    }
}

/// Translates `trig_mode` into the base interest masks for the listener
/// and connection descriptors (spec §4.6). `RDHUP`/`ONESHOT` are added by
/// the reactor at registration time, not baked in here.
fn trigger_masks(trig_mode: u8) -> (Interest, Interest) {
    let mut listen = Interest::READABLE;
    let mut conn = Interest::READABLE;
    match trig_mode {
        0 => {}
        1 => conn |= Interest::EDGE_TRIGGERED,
        2 => listen |= Interest::EDGE_TRIGGERED,
        _ => {
            listen |= Interest::EDGE_TRIGGERED;
            conn |= Interest::EDGE_TRIGGERED;
        }
    }
    (listen, conn)
}

/// Immutable, validated configuration handed to the reactor at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub listen_interest: Interest,
    pub conn_interest: Interest,
    pub idle_timeout: Option<Duration>,
    pub opt_linger: bool,
    pub db_pool_size: usize,
    pub thread_num: usize,
    pub src_dir: PathBuf,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub log_queue_size: usize,
    pub max_connections: usize,
}

impl Config {
    pub fn listener_is_edge_triggered(&self) -> bool {
        has_et(self.listen_interest)
    }

    pub fn conn_is_edge_triggered(&self) -> bool {
        has_et(self.conn_interest)
    }
}

fn has_et(i: Interest) -> bool {
    (i | Interest::EDGE_TRIGGERED) == i
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            port: 8080,
            trig_mode: 3,
            timeout_ms: 60_000,
            opt_linger: false,
            db_pool_size: 4,
            thread_num: 4,
            src_dir: PathBuf::from("resources"),
            log_level: "info".into(),
            log_dir: None,
            log_queue_size: 1024,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    #[test]
    fn rejects_out_of_range_port() {
        let mut args = base_args();
        args.port = 80;
        assert!(matches!(args.into_config(), Err(ConfigError::PortOutOfRange(80))));
    }

    #[test]
    fn rejects_zero_threads() {
        let mut args = base_args();
        args.thread_num = 0;
        assert!(matches!(args.into_config(), Err(ConfigError::ZeroThreads)));
    }

    #[test]
    fn trig_mode_3_sets_both_edge_triggered() {
        let cfg = base_args().into_config().unwrap();
        assert!(cfg.listener_is_edge_triggered());
        assert!(cfg.conn_is_edge_triggered());
    }

    #[test]
    fn trig_mode_0_sets_neither_edge_triggered() {
        let mut args = base_args();
        args.trig_mode = 0;
        let cfg = args.into_config().unwrap();
        assert!(!cfg.listener_is_edge_triggered());
        assert!(!cfg.conn_is_edge_triggered());
    }

    #[test]
    fn timeout_zero_disables_the_reaper() {
        let mut args = base_args();
        args.timeout_ms = 0;
        let cfg = args.into_config().unwrap();
        assert!(cfg.idle_timeout.is_none());
    }
}
