//! The reactor: owns the listener, the demultiplexer, the idle-connection
//! timer and the connection registry on a single thread, and dispatches
//! per-connection I/O to a fixed [`WorkerPool`].
//!
//! Grounded on the original server's accept/epoll_wait main loop plus its
//! `ThreadPool::appendTask` dispatch, adapted to Rust's ownership rules: a
//! `Connection` behind `Arc<Mutex<_>>` is handed to a worker closure, and
//! the worker reports back over a channel instead of reaching back into
//! the epoll instance or the timer itself (both of which stay exclusively
//! owned by this thread, matching spec §4 on why only the reactor thread
//! ever calls `epoll_ctl`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::config::{Config, LISTEN_BACKLOG};
use crate::conn::{live_count, Connection};
use crate::epoll::{Demultiplexer, Interest};
use crate::error::ReactorError;
use crate::pool::WorkerPool;
use crate::timer::HeapTimer;

const MAX_EVENTS: usize = 1024;

/// Reported back to the reactor thread after a worker finishes one I/O
/// step; the reactor thread is the only one allowed to act on it.
enum Signal {
    NeedRead(RawFd),
    NeedWrite(RawFd),
    Closed(RawFd),
}

pub struct Reactor {
    config: Config,
    listen_fd: RawFd,
    demux: Demultiplexer,
    timer: HeapTimer,
    registry: HashMap<RawFd, Arc<Mutex<Connection>>>,
    pool: WorkerPool,
    tx: Sender<Signal>,
    rx: Receiver<Signal>,
}

impl Reactor {
    pub fn new(config: Config) -> Result<Self, ReactorError> {
        let listen_fd = bind_listener(config.port, config.opt_linger)?;
        let demux = Demultiplexer::new(MAX_EVENTS).map_err(ReactorError::Epoll)?;
        demux
            .add(listen_fd, config.listen_interest | Interest::RDHUP)
            .map_err(ReactorError::Epoll)?;

        let pool = WorkerPool::new(config.thread_num);
        let (tx, rx) = mpsc::channel();

        Ok(Self {
            config,
            listen_fd,
            demux,
            timer: HeapTimer::new(),
            registry: HashMap::new(),
            pool,
            tx,
            rx,
        })
    }

    /// Runs the reactor loop forever (or until `epoll_wait` returns a
    /// fatal, non-`EINTR` error).
    pub fn run(&mut self) -> Result<(), ReactorError> {
        info!(port = self.config.port, threads = self.config.thread_num, "reactor starting");
        loop {
            let timeout = self.timer.next_tick();
            let events = self.demux.wait(timeout).map_err(ReactorError::Epoll)?;

            let mut ready: Vec<(RawFd, bool, bool, bool, bool)> = Vec::with_capacity(events.len());
            for ev in events {
                let fd = ev.fd();
                ready.push((fd, fd == self.listen_fd, ev.is_hangup(), ev.is_readable(), ev.is_writable()));
            }

            // Mirrors the original server's strict if/else-if chain:
            // listener accept, then hangup/error, then read, then write --
            // never more than one branch per event. A client that sends a
            // request and closes fires EPOLLIN|EPOLLRDHUP together, and
            // handling both would race a read/process task against a
            // premature close.
            for (fd, is_listener, hangup, readable, writable) in ready {
                if is_listener {
                    self.accept_all();
                } else if hangup {
                    self.close_conn(fd);
                } else if readable {
                    self.dispatch_read(fd);
                } else if writable {
                    self.dispatch_write(fd);
                }
            }

            self.drain_signals();
        }
    }

    fn dispatch_read(&mut self, fd: RawFd) {
        let Some(conn) = self.registry.get(&fd).cloned() else { return };
        if let Some(timeout) = self.config.idle_timeout {
            self.timer.adjust(fd, timeout);
        }

        let tx = self.tx.clone();
        self.pool.submit(move || {
            let mut conn = conn.lock().unwrap();
            let signal = match conn.read() {
                Ok(0) => Signal::Closed(fd),
                Ok(_) => {
                    if conn.process() {
                        Signal::NeedWrite(fd)
                    } else {
                        Signal::NeedRead(fd)
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Signal::NeedRead(fd),
                Err(_) => Signal::Closed(fd),
            };
            let _ = tx.send(signal);
        });
    }

    fn dispatch_write(&mut self, fd: RawFd) {
        let Some(conn) = self.registry.get(&fd).cloned() else { return };
        if let Some(timeout) = self.config.idle_timeout {
            self.timer.adjust(fd, timeout);
        }

        let tx = self.tx.clone();
        self.pool.submit(move || {
            let mut conn = conn.lock().unwrap();
            let signal = match conn.write() {
                Ok(_) if conn.to_write_bytes() == 0 => {
                    if conn.is_keep_alive() {
                        Signal::NeedRead(fd)
                    } else {
                        Signal::Closed(fd)
                    }
                }
                Ok(_) => Signal::NeedWrite(fd),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Signal::NeedWrite(fd),
                Err(_) => Signal::Closed(fd),
            };
            let _ = tx.send(signal);
        });
    }

    fn drain_signals(&mut self) {
        while let Ok(signal) = self.rx.try_recv() {
            match signal {
                Signal::NeedRead(fd) => {
                    let _ = self.demux.modify(
                        fd,
                        self.config.conn_interest | Interest::RDHUP | Interest::ONESHOT,
                    );
                }
                Signal::NeedWrite(fd) => {
                    let _ = self.demux.modify(
                        fd,
                        self.config.conn_interest
                            | Interest::WRITABLE
                            | Interest::RDHUP
                            | Interest::ONESHOT,
                    );
                }
                Signal::Closed(fd) => self.close_conn(fd),
            }
        }
    }

    /// Accepts every pending connection (the listener is level- or
    /// edge-triggered depending on `trig_mode`, but either way a single
    /// `accept4` call may leave more backlog behind).
    fn accept_all(&mut self) {
        loop {
            let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            let mut addrlen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            // SAFETY: `addr`/`addrlen` are valid out-parameters sized for
            // `sockaddr_in`; `listen_fd` is the listener we own.
            let fd = unsafe {
                libc::accept4(
                    self.listen_fd,
                    (&mut addr as *mut libc::sockaddr_in).cast(),
                    &mut addrlen,
                    libc::SOCK_NONBLOCK,
                )
            };
            if fd < 0 {
                break;
            }

            if live_count() >= self.config.max_connections {
                warn!(fd, "connection capacity reached, refusing new connection");
                unsafe {
                    libc::send(fd, b"Server busy!\n".as_ptr().cast(), 13, 0);
                    libc::close(fd);
                }
                continue;
            }

            let peer = sockaddr_to_std(&addr);
            let conn = Connection::new(fd, peer, self.config.src_dir.clone(), self.config.conn_is_edge_triggered());
            let conn = Arc::new(Mutex::new(conn));

            if let Err(e) = self.demux.add(
                fd,
                self.config.conn_interest | Interest::RDHUP | Interest::ONESHOT,
            ) {
                warn!(fd, %e, "failed to register new connection with epoll");
                continue;
            }

            if let Some(timeout) = self.config.idle_timeout {
                let tx = self.tx.clone();
                self.timer.add(fd, timeout, Box::new(move || {
                    let _ = tx.send(Signal::Closed(fd));
                }));
            }

            self.registry.insert(fd, conn);
        }
    }

    fn close_conn(&mut self, fd: RawFd) {
        self.timer.cancel(fd);
        let _ = self.demux.remove(fd);
        if let Some(conn) = self.registry.remove(&fd) {
            conn.lock().unwrap().close();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        // SAFETY: `listen_fd` is owned exclusively by this reactor.
        unsafe {
            libc::close(self.listen_fd);
        }
    }
}

fn sockaddr_to_std(addr: &libc::sockaddr_in) -> SocketAddr {
    let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    SocketAddr::from((ip, port))
}

fn bind_listener(port: u16, opt_linger: bool) -> Result<RawFd, ReactorError> {
    // SAFETY: standard blocking socket creation with no pointer arguments.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(ReactorError::Socket(std::io::Error::last_os_error()));
    }

    set_reuse_addr(fd)?;
    if opt_linger {
        set_linger(fd)?;
    }

    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr { s_addr: libc::INADDR_ANY.to_be() },
        sin_zero: [0; 8],
    };
    // SAFETY: `addr` is a fully initialized `sockaddr_in` sized correctly
    // for the cast below.
    let rc = unsafe {
        libc::bind(
            fd,
            (&addr as *const libc::sockaddr_in).cast(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(ReactorError::Socket(std::io::Error::last_os_error()));
    }

    // SAFETY: no pointer arguments beyond the fd itself.
    if unsafe { libc::listen(fd, LISTEN_BACKLOG) } < 0 {
        return Err(ReactorError::Socket(std::io::Error::last_os_error()));
    }

    set_nonblocking(fd)?;
    Ok(fd)
}

fn set_reuse_addr(fd: RawFd) -> Result<(), ReactorError> {
    let on: libc::c_int = 1;
    // SAFETY: `on` is a valid `c_int` living on the stack for the call.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&on as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(ReactorError::Socket(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn set_linger(fd: RawFd) -> Result<(), ReactorError> {
    let linger = libc::linger { l_onoff: 1, l_linger: 1 };
    // SAFETY: `linger` is a valid, fully initialized `libc::linger`.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            (&linger as *const libc::linger).cast(),
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(ReactorError::Socket(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> Result<(), ReactorError> {
    // SAFETY: F_GETFL/F_SETFL on an fd we own, no pointer arguments.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(ReactorError::Socket(std::io::Error::last_os_error()));
    }
    // SAFETY: same as above.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(ReactorError::Socket(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::TcpStream;

    use super::*;
    use crate::config::Args;

    fn test_config(port: u16) -> Config {
        let mut args = Args {
            port,
            trig_mode: 3,
            timeout_ms: 60_000,
            opt_linger: false,
            db_pool_size: 1,
            thread_num: 2,
            src_dir: std::env::temp_dir(),
            log_level: "error".into(),
            log_dir: None,
            log_queue_size: 64,
            max_connections: crate::config::DEFAULT_MAX_CONNECTIONS,
        };
        args.port = port;
        args.into_config().unwrap()
    }

    #[test]
    fn binds_and_accepts_one_connection() {
        let config = test_config(0);
        // port 0 lets the kernel pick; re-read it back out is unnecessary
        // for this smoke test since we only assert bind+listen succeeded.
        let reactor = Reactor::new(config);
        assert!(reactor.is_ok());
    }

    #[test]
    fn second_bind_to_the_same_port_fails() {
        let config = test_config(18_111);
        let _first = Reactor::new(config.clone()).unwrap();
        let dup = Reactor::new(config);
        assert!(dup.is_err());
    }

    #[test]
    fn accept_all_registers_a_connecting_client() {
        let config = test_config(18_222);
        let mut reactor = Reactor::new(config).unwrap();
        let _client = TcpStream::connect(("127.0.0.1", 18_222)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        reactor.accept_all();
        assert_eq!(reactor.registry.len(), 1);
    }
}
