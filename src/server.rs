//! Event-loop wiring for the kvd server.
//!
//! One `EventLoop` drives everything: listener readiness feeds the accept
//! loop, per-client handlers parse newline-delimited commands, and a
//! housekeeping timer logs liveness and watches for shutdown. Replies are
//! written eagerly; the write side of a client is only registered while a
//! reply is still pending, and unregistered the moment the buffer drains.

use crate::config::KvdConfig;
use anyhow::{Context, Result};
use kvd_reactor::net;
use kvd_reactor::slowlog::{SlowLog, SlowLogEntry, HELP};
use kvd_reactor::{EventLoop, FileHandler, Mask, TimerAction, TimerHandler};
use socket2::{Domain, Socket};
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Descriptors reserved beyond `max_clients` for listeners, logging, and
/// the backend itself.
const RESERVED_FDS: usize = 32;

/// Cap on accepts drained per readiness notification so one busy listener
/// cannot monopolize a cycle.
const MAX_ACCEPTS_PER_EVENT: usize = 1000;

/// Clients feeding us more than this without a newline are cut off.
const MAX_INBUF: usize = 1 << 20;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

struct ServerState {
    slowlog: SlowLog,
    clients: usize,
    commands: u64,
}

type SharedState = Rc<RefCell<ServerState>>;

// ─── Command dispatch ────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Lines(Vec<String>),
    Quit,
}

fn dispatch(state: &SharedState, client_name: &mut String, argv: &[String]) -> Reply {
    match argv[0].to_ascii_uppercase().as_str() {
        "PING" => Reply::Lines(vec![argv.get(1).cloned().unwrap_or_else(|| "PONG".into())]),
        "ECHO" => Reply::Lines(vec![argv[1..].join(" ")]),
        "NAME" => {
            *client_name = argv.get(1).cloned().unwrap_or_default();
            Reply::Lines(vec!["OK".into()])
        }
        "SLOWLOG" => slowlog_command(state, &argv[1..]),
        "QUIT" => Reply::Quit,
        _ => Reply::Lines(vec![format!("ERR unknown command '{}'", argv[0])]),
    }
}

fn slowlog_command(state: &SharedState, args: &[String]) -> Reply {
    let sub = args.first().map(|s| s.to_ascii_uppercase()).unwrap_or_default();
    match sub.as_str() {
        "GET" => {
            let count = match args.get(1) {
                Some(raw) => match raw.parse::<usize>() {
                    Ok(n) => n,
                    Err(_) => return Reply::Lines(vec![format!("ERR invalid count '{raw}'")]),
                },
                None => 10,
            };
            let st = state.borrow();
            Reply::Lines(st.slowlog.entries(count).iter().map(|e| format_entry(e)).collect())
        }
        "LEN" => Reply::Lines(vec![state.borrow().slowlog.len().to_string()]),
        "RESET" => {
            state.borrow_mut().slowlog.reset();
            Reply::Lines(vec!["OK".into()])
        }
        "HELP" => Reply::Lines(HELP.iter().map(|s| s.to_string()).collect()),
        other => Reply::Lines(vec![format!("ERR unknown SLOWLOG subcommand '{other}'")]),
    }
}

fn format_entry(entry: &SlowLogEntry) -> String {
    format!(
        "{} {} {} {} {} {}",
        entry.id,
        entry.wall_time,
        entry.duration_us,
        entry.peer_addr,
        if entry.client_name.is_empty() { "-" } else { entry.client_name.as_str() },
        entry.argv.join(" ")
    )
}

// ─── Client connection ───────────────────────────────────────────────────────

struct Connection {
    sock: Socket,
    peer: String,
    name: String,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    self_ref: Weak<RefCell<Connection>>,
    write_registered: bool,
    closing: bool,
    closed: bool,
    state: SharedState,
}

impl Connection {
    /// Wrap an accepted socket and register it with the loop. On
    /// registration failure the socket is dropped, which closes it.
    fn attach(el: &mut EventLoop, sock: Socket, state: SharedState) {
        let fd = sock.as_raw_fd();
        let peer = net::peer_addr_string(&sock);
        let conn = Rc::new(RefCell::new(Connection {
            sock,
            peer: peer.clone(),
            name: String::new(),
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            self_ref: Weak::new(),
            write_registered: false,
            closing: false,
            closed: false,
            state: state.clone(),
        }));
        conn.borrow_mut().self_ref = Rc::downgrade(&conn);
        if let Err(e) = el.register_file(fd, Mask::READABLE, conn) {
            warn!(%peer, error = %e, "rejecting client: cannot register");
            return;
        }
        state.borrow_mut().clients += 1;
        info!(%peer, fd, "client connected");
    }

    fn drain_lines(&mut self) {
        while !self.closing {
            let pos = match self.inbuf.iter().position(|&b| b == b'\n') {
                Some(p) => p,
                None => break,
            };
            let raw: Vec<u8> = self.inbuf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let argv: Vec<String> = line.split_whitespace().map(str::to_string).collect();
            if argv.is_empty() {
                continue;
            }

            let started = Instant::now();
            let reply = dispatch(&self.state, &mut self.name, &argv);
            let duration_us = started.elapsed().as_micros() as i64;
            {
                let mut st = self.state.borrow_mut();
                st.commands += 1;
                st.slowlog.push_if_needed(&self.peer, &self.name, &argv, duration_us);
            }

            match reply {
                Reply::Lines(lines) => {
                    for line in lines {
                        self.outbuf.extend_from_slice(line.as_bytes());
                        self.outbuf.push(b'\n');
                    }
                }
                Reply::Quit => {
                    self.outbuf.extend_from_slice(b"OK\n");
                    self.closing = true;
                }
            }
        }
    }

    fn flush(&mut self, el: &mut EventLoop, fd: RawFd) {
        if self.closed {
            return;
        }
        while !self.outbuf.is_empty() {
            match (&self.sock).write(&self.outbuf) {
                Ok(0) => break,
                Ok(n) => {
                    self.outbuf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "write failed");
                    self.close(el, fd);
                    return;
                }
            }
        }
        if self.outbuf.is_empty() {
            if self.write_registered {
                el.unregister_file(fd, Mask::WRITABLE);
                self.write_registered = false;
            }
            if self.closing {
                self.close(el, fd);
            }
        } else if !self.write_registered {
            // Reply left over: finish it when the socket drains. The same
            // handler object serves both sides.
            if let Some(me) = self.self_ref.upgrade() {
                if let Err(e) = el.register_file(fd, Mask::WRITABLE, me) {
                    warn!(peer = %self.peer, error = %e, "cannot watch for writable");
                    self.close(el, fd);
                    return;
                }
                self.write_registered = true;
            }
        }
    }

    fn close(&mut self, el: &mut EventLoop, fd: RawFd) {
        if self.closed {
            return;
        }
        self.closed = true;
        el.unregister_file(fd, Mask::READABLE | Mask::WRITABLE);
        self.state.borrow_mut().clients -= 1;
        info!(peer = %self.peer, fd, "client disconnected");
    }
}

impl FileHandler for Connection {
    fn readable(&mut self, el: &mut EventLoop, fd: RawFd, _mask: Mask) {
        if self.closed {
            return;
        }
        let mut chunk = [0u8; 4096];
        loop {
            match (&self.sock).read(&mut chunk) {
                Ok(0) => {
                    self.close(el, fd);
                    return;
                }
                Ok(n) => {
                    self.inbuf.extend_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "read failed");
                    self.close(el, fd);
                    return;
                }
            }
        }
        if self.inbuf.len() > MAX_INBUF {
            warn!(peer = %self.peer, "input buffer overrun");
            self.close(el, fd);
            return;
        }
        self.drain_lines();
        self.flush(el, fd);
    }

    fn writable(&mut self, el: &mut EventLoop, fd: RawFd, _mask: Mask) {
        self.flush(el, fd);
    }
}

// ─── Listener ────────────────────────────────────────────────────────────────

struct Acceptor {
    listener: Socket,
    state: SharedState,
    keepalive_secs: i32,
    tcp: bool,
}

impl Acceptor {
    fn prepare(&self, sock: &Socket) -> Result<()> {
        net::set_blocking(sock, false)?;
        if self.tcp {
            net::set_nodelay(sock, true)?;
            if self.keepalive_secs > 0 {
                net::set_keepalive(sock, self.keepalive_secs)?;
            }
        }
        Ok(())
    }
}

impl FileHandler for Acceptor {
    fn readable(&mut self, el: &mut EventLoop, _fd: RawFd, _mask: Mask) {
        for _ in 0..MAX_ACCEPTS_PER_EVENT {
            let sock = match net::accept(&self.listener) {
                Ok((sock, _addr)) => sock,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            };
            if let Err(e) = self.prepare(&sock) {
                warn!(error = %e, "failed to prepare accepted socket");
                continue;
            }
            Connection::attach(el, sock, self.state.clone());
        }
    }
}

// ─── Housekeeping ────────────────────────────────────────────────────────────

struct Cron {
    state: SharedState,
    interval_ms: u64,
}

impl TimerHandler for Cron {
    fn fire(&mut self, el: &mut EventLoop, _id: u64) -> TimerAction {
        if SHUTDOWN.load(Ordering::SeqCst) {
            info!("shutdown requested, stopping event loop");
            el.stop();
            return TimerAction::Done;
        }
        let st = self.state.borrow();
        debug!(
            clients = st.clients,
            commands = st.commands,
            slowlog_len = st.slowlog.len(),
            "cron"
        );
        TimerAction::Rearm(self.interval_ms)
    }
}

// ─── Entry point ─────────────────────────────────────────────────────────────

pub fn run(config: &KvdConfig) -> Result<()> {
    unsafe {
        let handler = request_shutdown as extern "C" fn(libc::c_int);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        // Writes to dead clients must surface as errors, not kill us.
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let mut el =
        EventLoop::new(config.max_clients + RESERVED_FDS).context("create event loop")?;
    info!(backend = el.backend_name(), set_size = el.set_size(), "event loop ready");

    let state: SharedState = Rc::new(RefCell::new(ServerState {
        slowlog: SlowLog::new(config.slowlog_log_slower_than_us, config.slowlog_max_len),
        clients: 0,
        commands: 0,
    }));

    let family = if config.bind.contains(':') { Domain::IPV6 } else { Domain::IPV4 };
    let listener = net::tcp_server(config.port, Some(&config.bind), family, config.backlog)?;
    net::set_blocking(&listener, false)?;
    info!("listening on {}", net::local_addr_string(&listener));
    let lfd = listener.as_raw_fd();
    el.register_file(
        lfd,
        Mask::READABLE,
        Rc::new(RefCell::new(Acceptor {
            listener,
            state: state.clone(),
            keepalive_secs: config.tcp_keepalive,
            tcp: true,
        })),
    )?;

    if let Some(path) = &config.unixsocket {
        let path = PathBuf::from(path);
        let unix_listener = net::unix_server(&path, Some(0o700), config.backlog)?;
        net::set_blocking(&unix_listener, false)?;
        info!("listening on {}", path.display());
        let ufd = unix_listener.as_raw_fd();
        el.register_file(
            ufd,
            Mask::READABLE,
            Rc::new(RefCell::new(Acceptor {
                listener: unix_listener,
                state: state.clone(),
                keepalive_secs: 0,
                tcp: false,
            })),
        )?;
    }

    el.create_timer(
        config.cron_interval_ms,
        Rc::new(RefCell::new(Cron { state: state.clone(), interval_ms: config.cron_interval_ms })),
    );

    el.run();

    info!(commands = state.borrow().commands, "server stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
