use crate::event::EventMask;
use crate::sockets;
use std::io;
use std::os::unix::io::RawFd;

/// Per-socket state every handler kind carries: the fd, the interest mask
/// last committed to the readiness primitive, and the read-channel flag a
/// half-close sets. Dropping an owning base closes the fd.
pub(crate) struct HandlerBase {
    pub fd: RawFd,
    pub mask: EventMask,
    pub read_closed: bool,
    owns_fd: bool,
}

impl HandlerBase {
    /// Take ownership of a fresh stream fd. Nonblocking mode, TCP_NODELAY
    /// and SIGPIPE suppression are in place before the fd reaches the loop.
    pub fn adopt_stream(fd: RawFd) -> io::Result<Self> {
        sockets::set_nonblocking(fd)?;
        sockets::set_tcp_nodelay(fd)?;
        sockets::suppress_sigpipe(fd)?;
        Ok(Self {
            fd,
            mask: EventMask::NONE,
            read_closed: false,
            owns_fd: true,
        })
    }

    /// Listening sockets only need nonblocking mode; accepted children get
    /// the full treatment when they are adopted as streams.
    pub fn adopt_listener(fd: RawFd) -> io::Result<Self> {
        sockets::set_nonblocking(fd)?;
        Ok(Self {
            fd,
            mask: EventMask::NONE,
            read_closed: false,
            owns_fd: true,
        })
    }

    /// Wrap an fd owned elsewhere (the wake pipe's read end).
    pub fn wrap(fd: RawFd) -> Self {
        Self {
            fd,
            mask: EventMask::NONE,
            read_closed: false,
            owns_fd: false,
        }
    }

    /// Half-shutdown of the read side; read dispatch is suppressed from
    /// here on.
    pub fn close_read_channel(&mut self) {
        if !self.read_closed {
            sockets::shutdown_read(self.fd);
            self.read_closed = true;
        }
    }
}

impl Drop for HandlerBase {
    fn drop(&mut self) {
        if self.owns_fd && self.fd != sockets::INVALID_SOCKET {
            sockets::close_socket(self.fd);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fd_is_open(fd: RawFd) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) >= 0 }
    }

    fn loopback_pair() -> (RawFd, RawFd) {
        let (lfd, port) = sockets::new_tcp_acceptor(0, Some("127.0.0.1"), true).unwrap();
        let client =
            sockets::new_tcp_connection("127.0.0.1", port, sockets::AddrFamily::V4).unwrap();
        let accepted = unsafe { libc::accept(lfd, std::ptr::null_mut(), std::ptr::null_mut()) };
        assert!(accepted >= 0);
        sockets::close_socket(lfd);
        (client, accepted)
    }

    #[test]
    pub fn test_adopt_sets_nonblocking_and_closes_on_drop() {
        let (client, accepted) = loopback_pair();
        {
            let base = HandlerBase::adopt_stream(client).unwrap();
            let flags = unsafe { libc::fcntl(base.fd, libc::F_GETFL) };
            assert!(flags & libc::O_NONBLOCK != 0);
            assert!(base.mask.is_empty());
            assert!(!base.read_closed);
        }
        assert!(!fd_is_open(client));
        sockets::close_socket(accepted);
    }

    #[test]
    pub fn test_wrap_does_not_close() {
        let (rd, wr) = sockets::new_pipe().unwrap();
        {
            let _base = HandlerBase::wrap(rd);
        }
        assert!(fd_is_open(rd));
        sockets::close_socket(rd);
        sockets::close_socket(wr);
    }

    #[test]
    pub fn test_close_read_channel_reports_eof() {
        let (client, accepted) = loopback_pair();
        let mut base = HandlerBase::adopt_stream(accepted).unwrap();
        base.close_read_channel();
        assert!(base.read_closed);
        // the peer keeps a usable write direction closed only on our side;
        // our reads now see EOF
        let mut buf = [0u8; 8];
        match sockets::read_some(base.fd, &mut buf) {
            sockets::RwOutcome::Closed => {}
            other => panic!("expected EOF after half-close, got {:?}", other),
        }
        sockets::close_socket(client);
    }
}
