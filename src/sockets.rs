//! Portable syscall wrappers: socket construction with scoped guards,
//! nonblocking short-op reads/writes, and address introspection.

use crate::logmsg;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::os::unix::io::RawFd;
use thiserror::Error;

pub const INVALID_SOCKET: RawFd = -1;

#[cfg(not(target_vendor = "apple"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(target_vendor = "apple")]
const SEND_FLAGS: libc::c_int = 0;

/// A failed socket construction (socket/connect/bind/listen/setsockopt).
/// Carries the failing step and the OS error, errno included.
#[derive(Debug, Error)]
#[error("{context}: {source}")]
pub struct NetworkError {
    context: String,
    #[source]
    source: io::Error,
}

impl NetworkError {
    pub(crate) fn last(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            source: io::Error::last_os_error(),
        }
    }
    pub(crate) fn wrap(context: impl Into<String>, source: io::Error) -> Self {
        Self {
            context: context.into(),
            source,
        }
    }
    pub fn raw_os_error(&self) -> Option<i32> {
        self.source.raw_os_error()
    }
}

pub type NetResult<T> = Result<T, NetworkError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    V4,
    V6,
}

/// Scoped socket acquisition: closes the wrapped fd on drop unless
/// `release()` hands ownership out at the end of a successful construction.
pub struct SocketGuard {
    fd: RawFd,
}

impl SocketGuard {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }
    pub fn get(&self) -> RawFd {
        self.fd
    }
    pub fn release(mut self) -> RawFd {
        mem::replace(&mut self.fd, INVALID_SOCKET)
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if self.fd != INVALID_SOCKET {
            close_socket(self.fd);
        }
    }
}

pub(crate) fn close_socket(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn setsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: i32) -> io::Result<()> {
    let res = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const i32 as *const libc::c_void,
            mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn set_tcp_nodelay(fd: RawFd) -> io::Result<()> {
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
}

/// On Apple platforms SIGPIPE is disabled per socket; elsewhere every send
/// carries `MSG_NOSIGNAL` instead and this is a no-op.
pub(crate) fn suppress_sigpipe(fd: RawFd) -> io::Result<()> {
    #[cfg(target_vendor = "apple")]
    {
        return setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1);
    }
    #[cfg(not(target_vendor = "apple"))]
    {
        let _ = fd;
        Ok(())
    }
}

/// Half-close the read side; subsequent reads report EOF to the peer logic.
pub(crate) fn shutdown_read(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RD);
    }
}

pub(crate) fn new_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    #[cfg(target_os = "linux")]
    let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    #[cfg(not(target_os = "linux"))]
    let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    #[cfg(not(target_os = "linux"))]
    unsafe {
        libc::fcntl(fds[0], libc::F_SETFD, libc::FD_CLOEXEC);
        libc::fcntl(fds[1], libc::F_SETFD, libc::FD_CLOEXEC);
    }
    Ok((fds[0], fds[1]))
}

//====================================================================================
//            sockaddr conversion
//====================================================================================

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                // octets are already network order; keep the byte layout as-is
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn sockaddr_to(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin =
                unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe {
                &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
            };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

//====================================================================================
//            construction
//====================================================================================

/// Resolve `host:port`, honoring the family hint: an address of the
/// preferred family wins, any other resolved address is the fallback.
pub fn resolve_host(host: &str, port: u16, preferred: AddrFamily) -> NetResult<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|err| NetworkError::wrap(format!("cannot resolve {}", host), err))?
        .collect();
    let wanted = |a: &&SocketAddr| match preferred {
        AddrFamily::V4 => a.is_ipv4(),
        AddrFamily::V6 => a.is_ipv6(),
    };
    addrs
        .iter()
        .find(wanted)
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            NetworkError::wrap(
                format!("no usable address for {}", host),
                io::Error::new(io::ErrorKind::NotFound, "empty resolver result"),
            )
        })
}

fn connect_to(addr: SocketAddr) -> NetResult<RawFd> {
    let family = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(NetworkError::last("socket"));
    }
    let guard = SocketGuard::new(fd);
    let (storage, len) = sockaddr_from(&addr);
    let res = unsafe {
        libc::connect(
            guard.get(),
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if res != 0 {
        return Err(NetworkError::last(format!("connect to {}", addr)));
    }
    Ok(guard.release())
}

/// Connect to `host:port`. When the preferred IPv6 attempt fails the socket
/// is closed and the connect is retried with the family forced to IPv4;
/// only when that also fails does the error surface.
pub fn new_tcp_connection(host: &str, port: u16, preferred: AddrFamily) -> NetResult<RawFd> {
    let addr = resolve_host(host, port, preferred)?;
    match connect_to(addr) {
        Ok(fd) => Ok(fd),
        Err(err) if addr.is_ipv6() => {
            logmsg!("connect to {} failed ({}), retrying over IPv4", addr, err);
            let addr4 = resolve_host(host, port, AddrFamily::V4)?;
            if addr4.is_ipv6() {
                return Err(err); // the host has no IPv4 address at all
            }
            connect_to(addr4)
        }
        Err(err) => Err(err),
    }
}

fn bind_and_listen(addr: SocketAddr, reuse_addr: bool) -> NetResult<(RawFd, u16)> {
    let family = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(NetworkError::last("socket"));
    }
    let guard = SocketGuard::new(fd);
    if reuse_addr {
        setsockopt_int(guard.get(), libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
            .map_err(|err| NetworkError::wrap("setsockopt(SO_REUSEADDR)", err))?;
    }
    if addr.is_ipv6() {
        // dual-stack: let the v6 listener take v4 requests too
        setsockopt_int(guard.get(), libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 0)
            .map_err(|err| NetworkError::wrap("setsockopt(IPV6_V6ONLY)", err))?;
    }
    let (storage, len) = sockaddr_from(&addr);
    let res = unsafe {
        libc::bind(
            guard.get(),
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if res != 0 {
        return Err(NetworkError::last(format!("bind to {}", addr)));
    }
    // read the port back so that a port-0 request reports the ephemeral bind
    let bound_port = local_addr(guard.get())
        .map(|a| a.port())
        .ok_or_else(|| NetworkError::last("getsockname"))?;
    if unsafe { libc::listen(guard.get(), libc::SOMAXCONN) } != 0 {
        return Err(NetworkError::last("listen"));
    }
    Ok((guard.release(), bound_port))
}

/// Create a listening socket. Without an explicit `addr` the IPv6 wildcard
/// is tried first (dual-stack) with an IPv4 wildcard fallback for hosts
/// that cannot bind v6. Returns the fd and the actually bound port.
pub fn new_tcp_acceptor(port: u16, addr: Option<&str>, reuse_addr: bool) -> NetResult<(RawFd, u16)> {
    match addr {
        Some(host) => {
            let bind_addr = resolve_host(host, port, AddrFamily::V6)?;
            bind_and_listen(bind_addr, reuse_addr)
        }
        None => {
            let any6 = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0));
            bind_and_listen(any6, reuse_addr).or_else(|err| {
                logmsg!("wildcard IPv6 bind failed ({}), falling back to IPv4", err);
                let any4 = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
                bind_and_listen(any4, reuse_addr)
            })
        }
    }
}

//====================================================================================
//            queries and short ops
//====================================================================================

pub fn local_addr(fd: RawFd) -> Option<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let res = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if res != 0 {
        return None;
    }
    sockaddr_to(&storage)
}

pub fn remote_addr(fd: RawFd) -> Option<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let res = unsafe {
        libc::getpeername(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if res != 0 {
        return None;
    }
    sockaddr_to(&storage)
}

pub fn local_port(fd: RawFd) -> Option<u16> {
    local_addr(fd).map(|a| a.port())
}

pub fn remote_port(fd: RawFd) -> Option<u16> {
    remote_addr(fd).map(|a| a.port())
}

/// Outcome of one nonblocking read or write.
#[derive(Debug)]
pub enum RwOutcome {
    Bytes(usize),
    /// Nothing to do right now; wait for the next readiness event.
    WouldBlock,
    /// Orderly close by the peer.
    Closed,
    Failed(io::Error),
}

pub fn read_some(fd: RawFd, buf: &mut [u8]) -> RwOutcome {
    debug_assert!(!buf.is_empty());
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n > 0 {
        return RwOutcome::Bytes(n as usize);
    }
    if n == 0 {
        return RwOutcome::Closed;
    }
    let err = io::Error::last_os_error();
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => RwOutcome::WouldBlock,
        _ => RwOutcome::Failed(err),
    }
}

pub fn write_some(fd: RawFd, buf: &[u8]) -> RwOutcome {
    debug_assert!(!buf.is_empty());
    let n = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            SEND_FLAGS,
        )
    };
    if n > 0 {
        return RwOutcome::Bytes(n as usize);
    }
    if n == 0 {
        return RwOutcome::Closed;
    }
    let err = io::Error::last_os_error();
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => RwOutcome::WouldBlock,
        _ => RwOutcome::Failed(err),
    }
}

/// Accept one pending connection; `None` is a spurious wakeup.
pub fn accept_one(fd: RawFd) -> io::Result<Option<RawFd>> {
    let res = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
    if res >= 0 {
        return Ok(Some(res));
    }
    let err = io::Error::last_os_error();
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
        _ => Err(err),
    }
}
