//! TCP and Unix-domain socket helpers.
//!
//! Thin, synchronous wrappers over BSD sockets: option setters, resolver
//! shims, connect/bind/listen/accept, bounded read/write, and peer/local
//! name formatting. Every connected or accepted socket comes back as a
//! `socket2::Socket`; the caller owns the descriptor and registers it with
//! the event loop itself. The descriptor is closed when the `Socket` drops,
//! so unregister first.
//!
//! Setup-path failures carry their context through `anyhow`; per-byte I/O
//! and accept return plain `io::Result` so callers can classify EAGAIN and
//! friends.

use anyhow::{anyhow, bail, Context, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;

/// Synthetic address reported for Unix-domain peers.
pub const UNIX_PEER_ADDR: &str = "/unixsocket:0";

// ─── Option setters ──────────────────────────────────────────────────────────

pub fn set_blocking(sock: &Socket, blocking: bool) -> Result<()> {
    sock.set_nonblocking(!blocking).context("toggle O_NONBLOCK")?;
    Ok(())
}

pub fn set_nodelay(sock: &Socket, nodelay: bool) -> Result<()> {
    sock.set_nodelay(nodelay).context("TCP_NODELAY")?;
    Ok(())
}

pub fn set_send_timeout(sock: &Socket, timeout: Option<Duration>) -> Result<()> {
    sock.set_write_timeout(timeout).context("SO_SNDTIMEO")?;
    Ok(())
}

pub fn set_recv_timeout(sock: &Socket, timeout: Option<Duration>) -> Result<()> {
    sock.set_read_timeout(timeout).context("SO_RCVTIMEO")?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn setsockopt_int(
    fd: std::os::unix::io::RawFd,
    level: libc::c_int,
    opt: libc::c_int,
    val: libc::c_int,
) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &val as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Enable keep-alive with an `interval`-second probe schedule: first probe
/// after `interval` idle seconds, re-probes at a third of that (at least one
/// second), and three lost probes mark the peer dead. Platforms without the
/// fine-grained options get the coarse toggle only.
pub fn set_keepalive(sock: &Socket, interval_secs: i32) -> Result<()> {
    sock.set_keepalive(true).context("SO_KEEPALIVE")?;

    #[cfg(target_os = "linux")]
    {
        let fd = sock.as_raw_fd();
        setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, interval_secs)
            .context("TCP_KEEPIDLE")?;
        let mut intvl = interval_secs / 3;
        if intvl == 0 {
            intvl = 1;
        }
        setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, intvl)
            .context("TCP_KEEPINTVL")?;
        setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, 3).context("TCP_KEEPCNT")?;
    }

    #[cfg(not(target_os = "linux"))]
    let _ = interval_secs;

    Ok(())
}

// ─── Resolution ──────────────────────────────────────────────────────────────

/// Resolve `host` to a single address. With `numeric_only`, no lookups are
/// performed: the input must already be an IPv4/IPv6 literal.
pub fn resolve(host: &str, numeric_only: bool) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    if numeric_only {
        bail!("not a numeric address: {host}");
    }
    let addr = (host, 0u16)
        .to_socket_addrs()
        .with_context(|| format!("resolve {host}"))?
        .next()
        .ok_or_else(|| anyhow!("no addresses for {host}"))?;
    Ok(addr.ip())
}

// ─── Connect ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOpts {
    /// Leave the socket non-blocking; a connect still in progress counts as
    /// success.
    pub nonblock: bool,
    /// On failure with a source address, retry the whole procedure unbound.
    pub best_effort_bind: bool,
}

/// Connect to `host:port`, trying every resolved address in order.
pub fn tcp_connect(
    host: &str,
    port: u16,
    source: Option<&str>,
    opts: ConnectOpts,
) -> Result<Socket> {
    match tcp_connect_once(host, port, source, opts) {
        Err(_) if source.is_some() && opts.best_effort_bind => {
            tcp_connect_once(host, port, None, opts)
        }
        other => other,
    }
}

fn tcp_connect_once(
    host: &str,
    port: u16,
    source: Option<&str>,
    opts: ConnectOpts,
) -> Result<Socket> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolve {host}"))?
        .collect();
    let mut last_err: Option<io::Error> = None;
    for addr in addrs {
        let sock = match Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        {
            Ok(s) => s,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };
        sock.set_reuse_address(true).context("SO_REUSEADDR")?;
        if opts.nonblock {
            sock.set_nonblocking(true).context("toggle O_NONBLOCK")?;
        }
        if let Some(src) = source {
            bind_source(&sock, src)?;
        }
        match sock.connect(&addr.into()) {
            Ok(()) => return Ok(sock),
            Err(e)
                if opts.nonblock
                    && (e.raw_os_error() == Some(libc::EINPROGRESS)
                        || e.kind() == io::ErrorKind::WouldBlock) =>
            {
                return Ok(sock);
            }
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        }
    }
    match last_err {
        Some(e) => Err(anyhow::Error::from(e).context(format!("connect {host}:{port}"))),
        None => bail!("connect {host}:{port}: no addresses"),
    }
}

fn bind_source(sock: &Socket, source: &str) -> Result<()> {
    let addrs = (source, 0u16)
        .to_socket_addrs()
        .with_context(|| format!("resolve source address {source}"))?;
    for addr in addrs {
        if sock.bind(&addr.into()).is_ok() {
            return Ok(());
        }
    }
    bail!("bind source address {source}");
}

/// Connect to a Unix-domain socket at `path`.
pub fn unix_connect(path: &Path, nonblock: bool) -> Result<Socket> {
    let sock = Socket::new(Domain::UNIX, Type::STREAM, None).context("unix socket")?;
    if nonblock {
        sock.set_nonblocking(true).context("toggle O_NONBLOCK")?;
    }
    let addr = SockAddr::unix(path).with_context(|| format!("unix address {}", path.display()))?;
    match sock.connect(&addr) {
        Ok(()) => Ok(sock),
        Err(e)
            if nonblock
                && (e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock) =>
        {
            Ok(sock)
        }
        Err(e) => Err(anyhow::Error::from(e).context(format!("connect {}", path.display()))),
    }
}

// ─── Listen ──────────────────────────────────────────────────────────────────

/// Bind a listening TCP socket for the given family. `bind_addr` defaults to
/// the wildcard for the family. IPv6 listeners are V6-only so a dual-stack
/// deployment can bind both families side by side.
pub fn tcp_server(
    port: u16,
    bind_addr: Option<&str>,
    family: Domain,
    backlog: i32,
) -> Result<Socket> {
    let host = bind_addr.unwrap_or(if family == Domain::IPV6 { "::" } else { "0.0.0.0" });
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolve bind address {host}"))?
        .filter(|a| {
            (family == Domain::IPV6 && a.is_ipv6()) || (family == Domain::IPV4 && a.is_ipv4())
        })
        .collect();
    if addrs.is_empty() {
        bail!("no usable address for {host}:{port}");
    }
    let mut last_err: Option<anyhow::Error> = None;
    for addr in addrs {
        let sock = match Socket::new(family, Type::STREAM, Some(Protocol::TCP)) {
            Ok(s) => s,
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        };
        if addr.is_ipv6() {
            sock.set_only_v6(true).context("IPV6_V6ONLY")?;
        }
        sock.set_reuse_address(true).context("SO_REUSEADDR")?;
        let bound = sock
            .bind(&addr.into())
            .and_then(|()| sock.listen(backlog))
            .with_context(|| format!("bind/listen {addr}"));
        match bound {
            Ok(()) => return Ok(sock),
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("listen {host}:{port}")))
}

/// Bind a listening Unix-domain socket, replacing any stale file at `path`.
pub fn unix_server(path: &Path, perm: Option<u32>, backlog: i32) -> Result<Socket> {
    let sock = Socket::new(Domain::UNIX, Type::STREAM, None).context("unix socket")?;
    let _ = std::fs::remove_file(path);
    let addr = SockAddr::unix(path).with_context(|| format!("unix address {}", path.display()))?;
    sock.bind(&addr)
        .and_then(|()| sock.listen(backlog))
        .with_context(|| format!("bind/listen {}", path.display()))?;
    if let Some(mode) = perm {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    Ok(sock)
}

// ─── Accept ──────────────────────────────────────────────────────────────────

/// Accept one connection, retrying on EINTR. Other errors, including
/// EAGAIN on a drained non-blocking listener, go back to the caller.
pub fn accept(listener: &Socket) -> io::Result<(Socket, SockAddr)> {
    loop {
        match listener.accept() {
            Ok(pair) => return Ok(pair),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Accept on a TCP listener, returning the peer's socket address.
pub fn tcp_accept(listener: &Socket) -> io::Result<(Socket, SocketAddr)> {
    let (sock, addr) = accept(listener)?;
    let peer = addr
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer"))?;
    Ok((sock, peer))
}

/// Accept on a Unix-domain listener.
pub fn unix_accept(listener: &Socket) -> io::Result<Socket> {
    Ok(accept(listener)?.0)
}

// ─── Bounded I/O ─────────────────────────────────────────────────────────────

/// Read until `buf` is full. A clean EOF reports the bytes transferred so
/// far; errors surface as-is.
pub fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = r.read(&mut buf[total..])?;
        if n == 0 {
            return Ok(total);
        }
        total += n;
    }
    Ok(total)
}

/// Write all of `buf`. A zero-length write reports the bytes transferred so
/// far; errors surface as-is.
pub fn write_full<W: Write>(w: &mut W, buf: &[u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = w.write(&buf[total..])?;
        if n == 0 {
            return Ok(total);
        }
        total += n;
    }
    Ok(total)
}

// ─── Name formatting ─────────────────────────────────────────────────────────

/// `a.b.c.d:port` for IPv4, `[addr]:port` for IPv6.
pub fn format_addr(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{v4}:{port}"),
        IpAddr::V6(v6) => format!("[{v6}]:{port}"),
    }
}

fn describe_sockaddr(addr: &SockAddr) -> String {
    match addr.as_socket() {
        Some(sa) => format_addr(sa.ip(), sa.port()),
        None => UNIX_PEER_ADDR.to_string(),
    }
}

/// Formatted remote name of a connected socket; `"?:0"` when the kernel has
/// no peer for it.
pub fn peer_addr_string(sock: &Socket) -> String {
    match sock.peer_addr() {
        Ok(addr) => describe_sockaddr(&addr),
        Err(_) => "?:0".to_string(),
    }
}

/// Formatted local name of a bound socket.
pub fn local_addr_string(sock: &Socket) -> String {
    match sock.local_addr() {
        Ok(addr) => describe_sockaddr(&addr),
        Err(_) => "?:0".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
