//! Listening-socket handler: accepts one connection per readable event and
//! parks it in a slot the owning manager consumes by adopting a stream.

use crate::event::{EventMask, Operation};
use crate::handler::HandlerBase;
use crate::logmsg;
use crate::multiplexer::{OpsSink, SocketHandler};
use crate::sockets::{self, SocketGuard};
use crate::stream::{ReceivePolicy, StreamHandler, StreamManager};
use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

/// The broker side of a listening socket.
pub trait AcceptorManager {
    /// A freshly accepted connection waits in the context's slot; adopt it
    /// with `AcceptContext::adopt` or it is closed when the callback
    /// returns.
    fn new_connection(&mut self, ctx: &mut AcceptContext<'_>);

    /// accept(2) failed with something other than would-block; the
    /// acceptor has already been deregistered.
    fn io_failure(&mut self, _fd: RawFd, _op: Operation) {}
}

pub(crate) struct Acceptor {
    pub base: HandlerBase,
    pub mgr: Option<Rc<RefCell<dyn AcceptorManager>>>,
    accepted: Option<RawFd>,
}

impl Acceptor {
    pub fn new(fd: RawFd) -> io::Result<Self> {
        Ok(Self {
            base: HandlerBase::adopt_listener(fd)?,
            mgr: None,
            accepted: None,
        })
    }

    pub fn handle_read_event(&mut self, ops: &mut OpsSink<'_>) {
        match sockets::accept_one(self.base.fd) {
            Ok(Some(newfd)) => {
                self.accepted = Some(newfd);
                if let Some(mgr) = self.mgr.clone() {
                    let mut ctx = AcceptContext {
                        acceptor: &mut *self,
                        ops: ops.reborrow(),
                    };
                    mgr.borrow_mut().new_connection(&mut ctx);
                }
                if let Some(declined) = self.accepted.take() {
                    sockets::close_socket(declined);
                }
            }
            Ok(None) => {} // spurious wakeup
            Err(err) => {
                logmsg!("accept on fd {} failed: {}", self.base.fd, err);
                self.fail(ops);
            }
        }
    }

    /// Notify the manager and take the listener out of the loop.
    pub fn fail(&mut self, ops: &mut OpsSink<'_>) {
        if let Some(mgr) = self.mgr.clone() {
            mgr.borrow_mut().io_failure(self.base.fd, Operation::Read);
        }
        ops.del(self.base.fd, self.base.mask, Operation::Read);
    }
}

/// Hands the accepted fd from the listener to its manager.
pub struct AcceptContext<'a> {
    pub(crate) acceptor: &'a mut Acceptor,
    pub(crate) ops: OpsSink<'a>,
}

impl AcceptContext<'_> {
    pub fn listener_fd(&self) -> RawFd {
        self.acceptor.base.fd
    }

    pub fn accepted_fd(&self) -> Option<RawFd> {
        self.acceptor.accepted
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.acceptor.accepted.and_then(sockets::remote_addr)
    }

    /// Consume the accepted slot: wrap the fd into a stream handler read
    /// by `mgr` under `policy` and schedule its registration. Returns the
    /// stream's fd, the handle everything else addresses it by.
    pub fn adopt(
        &mut self,
        policy: ReceivePolicy,
        mgr: Rc<RefCell<dyn StreamManager>>,
    ) -> io::Result<RawFd> {
        let fd = self.acceptor.accepted.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no accepted connection pending")
        })?;
        let guard = SocketGuard::new(fd);
        let mut stream = StreamHandler::new(guard.get())?;
        let fd = guard.release();
        stream.configure_read(policy);
        stream.set_reader(mgr);
        self.ops
            .adopt(SocketHandler::Stream(stream), EventMask::READ);
        Ok(fd)
    }

    /// Stop listening; the acceptor handler is torn down at the iteration
    /// boundary.
    pub fn stop_accepting(&mut self) {
        let fd = self.acceptor.base.fd;
        let mask = self.acceptor.base.mask;
        self.ops.del(fd, mask, Operation::Read);
    }
}
