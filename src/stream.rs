//! Buffered, byte-oriented TCP connection handler: a receive-policy driven
//! read side and a two-buffer write pipeline that decouples the owning
//! broker from syscalls.

use crate::event::Operation;
use crate::handler::HandlerBase;
use crate::logmsg;
use crate::multiplexer::OpsSink;
use crate::sockets::{self, RwOutcome};
use crate::task::Resumable;
use std::cell::RefCell;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;

const DEFAULT_RECV_BUFFER: usize = 1024;

/// Decides when accumulated bytes are handed to the read-side manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivePolicy {
    /// Deliver batches of exactly `n` bytes.
    Exactly(usize),
    /// Deliver as soon as anything arrives, never more than `n` at once.
    AtMost(usize),
    /// Deliver once at least `n` bytes are buffered; the buffer keeps a
    /// margin above `n` so a burst does not force a second wakeup.
    AtLeast(usize),
}

impl ReceivePolicy {
    pub(crate) fn buffer_size(self) -> usize {
        match self {
            ReceivePolicy::Exactly(n) => n,
            ReceivePolicy::AtMost(n) => n,
            ReceivePolicy::AtLeast(n) => n + std::cmp::max(100, n / 10),
        }
    }
    pub(crate) fn threshold(self) -> usize {
        match self {
            ReceivePolicy::Exactly(n) => n,
            ReceivePolicy::AtMost(_) => 1,
            ReceivePolicy::AtLeast(n) => n,
        }
    }
}

/// The broker side of a stream. One manager reference is held per
/// direction and released independently when that direction leaves the
/// loop.
pub trait StreamManager {
    /// A batch of received bytes, sized by the stream's receive policy.
    fn consume(&mut self, ctx: &mut StreamContext<'_>, buf: &[u8]);

    /// One flush round moved `sent` bytes; `remaining` counts everything
    /// still queued, offline buffer included. Only called when
    /// acknowledgements were enabled via `ack_writes`.
    fn data_transferred(&mut self, _ctx: &mut StreamContext<'_>, _sent: usize, _remaining: usize) {}

    /// A read or write on the socket failed (or the peer closed); the
    /// direction has already been deregistered.
    fn io_failure(&mut self, _fd: RawFd, _op: Operation) {}
}

pub(crate) struct StreamHandler {
    pub base: HandlerBase,
    policy: ReceivePolicy,
    rd_buf: Vec<u8>,
    collected: usize,
    read_threshold: usize,
    pub reader: Option<Rc<RefCell<dyn StreamManager>>>,
    wr_offline_buf: Vec<u8>,
    wr_buf: Vec<u8>,
    written: usize,
    writing: bool,
    ack_writes: bool,
    pub writer: Option<Rc<RefCell<dyn StreamManager>>>,
}

impl StreamHandler {
    pub fn new(fd: RawFd) -> io::Result<Self> {
        let base = HandlerBase::adopt_stream(fd)?;
        let mut stream = Self {
            base,
            policy: ReceivePolicy::AtMost(DEFAULT_RECV_BUFFER),
            rd_buf: Vec::new(),
            collected: 0,
            read_threshold: 0,
            reader: None,
            wr_offline_buf: Vec::new(),
            wr_buf: Vec::new(),
            written: 0,
            writing: false,
            ack_writes: false,
            writer: None,
        };
        stream.read_loop();
        Ok(stream)
    }

    pub fn configure_read(&mut self, policy: ReceivePolicy) {
        debug_assert!(policy.buffer_size() > 0, "receive policy needs a size");
        self.policy = policy;
        self.read_loop();
    }

    pub fn set_reader(&mut self, mgr: Rc<RefCell<dyn StreamManager>>) {
        self.reader = Some(mgr);
    }

    pub fn ack_writes(&mut self, enable: bool) {
        self.ack_writes = enable;
    }

    /// Append to the offline buffer; nothing touches the socket until a
    /// flush and a writable event.
    pub fn write(&mut self, buf: &[u8]) {
        self.wr_offline_buf.extend_from_slice(buf);
    }

    pub fn pending_write_bytes(&self) -> usize {
        self.wr_buf.len() - self.written + self.wr_offline_buf.len()
    }

    pub fn is_writing(&self) -> bool {
        self.writing
    }

    /// Restart the read state machine: size the buffer and the delivery
    /// threshold for the current policy.
    fn read_loop(&mut self) {
        self.collected = 0;
        self.read_threshold = self.policy.threshold();
        let size = self.policy.buffer_size();
        self.rd_buf.resize(size, 0);
    }

    pub fn handle_read_event(&mut self, ops: &mut OpsSink<'_>) {
        debug_assert!(self.collected < self.rd_buf.len());
        match sockets::read_some(self.base.fd, &mut self.rd_buf[self.collected..]) {
            RwOutcome::Bytes(n) => {
                self.collected += n;
                if self.collected >= self.read_threshold {
                    let batch = mem::take(&mut self.rd_buf);
                    let len = self.collected;
                    if let Some(mgr) = self.reader.clone() {
                        let mut ctx = StreamContext {
                            stream: &mut *self,
                            mgr: &mgr,
                            ops: ops.reborrow(),
                        };
                        mgr.borrow_mut().consume(&mut ctx, &batch[..len]);
                    }
                    if self.rd_buf.is_empty() {
                        // unchanged policy: reuse the allocation
                        self.rd_buf = batch;
                    }
                    self.read_loop();
                }
            }
            RwOutcome::WouldBlock => {}
            RwOutcome::Closed => self.fail(Operation::Read, ops),
            RwOutcome::Failed(err) => {
                logmsg!("read error on fd {}: {}", self.base.fd, err);
                self.fail(Operation::Read, ops);
            }
        }
    }

    pub fn handle_write_event(&mut self, ops: &mut OpsSink<'_>) {
        if self.written >= self.wr_buf.len() {
            // spurious wakeup with an empty online buffer
            self.write_loop(ops);
            return;
        }
        match sockets::write_some(self.base.fd, &self.wr_buf[self.written..]) {
            RwOutcome::Bytes(n) => {
                self.written += n;
                if self.ack_writes {
                    let remaining = self.pending_write_bytes();
                    if let Some(mgr) = self.writer.clone() {
                        let mut ctx = StreamContext {
                            stream: &mut *self,
                            mgr: &mgr,
                            ops: ops.reborrow(),
                        };
                        mgr.borrow_mut().data_transferred(&mut ctx, n, remaining);
                    }
                }
                if self.written >= self.wr_buf.len() {
                    self.write_loop(ops);
                }
            }
            RwOutcome::WouldBlock => {}
            RwOutcome::Closed | RwOutcome::Failed(_) => self.fail(Operation::Write, ops),
        }
    }

    /// Idempotent: adopt the write-side manager, register write interest
    /// and stage the offline buffer. A flush while a drain is in flight is
    /// a no-op, the staged data follows automatically.
    pub fn flush(&mut self, mgr: &Rc<RefCell<dyn StreamManager>>, ops: &mut OpsSink<'_>) {
        if !self.wr_offline_buf.is_empty() && !self.writing {
            self.writer = Some(Rc::clone(mgr));
            self.writing = true;
            ops.add(self.base.fd, self.base.mask, Operation::Write);
            self.write_loop(ops);
        }
    }

    /// Rotate the write pipeline: when nothing is staged the write side
    /// goes quiet, otherwise offline becomes the online drain target.
    fn write_loop(&mut self, ops: &mut OpsSink<'_>) {
        self.written = 0;
        self.wr_buf.clear();
        if self.wr_offline_buf.is_empty() {
            if self.writing {
                self.writing = false;
                ops.del(self.base.fd, self.base.mask, Operation::Write);
            }
        } else {
            mem::swap(&mut self.wr_buf, &mut self.wr_offline_buf);
        }
    }

    /// Half-shut the read side and drop read interest; pending writes keep
    /// draining and the handler is torn down once both directions are out.
    pub fn stop_reading(&mut self, ops: &mut OpsSink<'_>) {
        self.base.close_read_channel();
        ops.del(self.base.fd, self.base.mask, Operation::Read);
    }

    /// Propagate an I/O failure for one direction and deregister it.
    pub fn fail(&mut self, op: Operation, ops: &mut OpsSink<'_>) {
        let mgr = match op {
            Operation::Read => self.reader.clone(),
            Operation::Write => self.writer.clone(),
        };
        if let Some(mgr) = mgr {
            mgr.borrow_mut().io_failure(self.base.fd, op);
        }
        if op == Operation::Write {
            self.writing = false;
        }
        ops.del(self.base.fd, self.base.mask, op);
    }

    pub fn removed_from_loop(&mut self, op: Operation) {
        match op {
            Operation::Read => self.reader = None,
            Operation::Write => {
                self.writer = None;
                self.writing = false;
            }
        }
    }
}

/// What a stream manager may do from inside its callbacks, without holding
/// any reference back to the handler.
pub struct StreamContext<'a> {
    pub(crate) stream: &'a mut StreamHandler,
    pub(crate) mgr: &'a Rc<RefCell<dyn StreamManager>>,
    pub(crate) ops: OpsSink<'a>,
}

impl StreamContext<'_> {
    pub fn fd(&self) -> RawFd {
        self.stream.base.fd
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        sockets::local_addr(self.fd())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        sockets::remote_addr(self.fd())
    }

    /// Queue bytes on the offline buffer.
    pub fn write(&mut self, buf: &[u8]) {
        self.stream.write(buf);
    }

    /// Flush queued bytes; this manager becomes the write-side owner.
    pub fn flush(&mut self) {
        self.stream.flush(self.mgr, &mut self.ops);
    }

    pub fn configure_read(&mut self, policy: ReceivePolicy) {
        self.stream.configure_read(policy);
    }

    pub fn ack_writes(&mut self, enable: bool) {
        self.stream.ack_writes(enable);
    }

    pub fn stop_reading(&mut self) {
        self.stream.stop_reading(&mut self.ops);
    }

    pub fn pending_write_bytes(&self) -> usize {
        self.stream.pending_write_bytes()
    }

    /// Hand a task to the loop (or the external scheduler, depending on
    /// its kind).
    pub fn exec_later(&self, task: Arc<dyn Resumable>) {
        self.ops.exec_later(task);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn test_policy_table() {
        assert_eq!(ReceivePolicy::Exactly(4).buffer_size(), 4);
        assert_eq!(ReceivePolicy::Exactly(4).threshold(), 4);

        assert_eq!(ReceivePolicy::AtMost(1024).buffer_size(), 1024);
        assert_eq!(ReceivePolicy::AtMost(1024).threshold(), 1);

        // margin is max(100, n/10)
        assert_eq!(ReceivePolicy::AtLeast(40).buffer_size(), 140);
        assert_eq!(ReceivePolicy::AtLeast(40).threshold(), 40);
        assert_eq!(ReceivePolicy::AtLeast(5000).buffer_size(), 5500);
        assert_eq!(ReceivePolicy::AtLeast(5000).threshold(), 5000);
    }

    fn loopback_stream() -> (StreamHandler, RawFd) {
        let (lfd, port) = sockets::new_tcp_acceptor(0, Some("127.0.0.1"), true).unwrap();
        let client =
            sockets::new_tcp_connection("127.0.0.1", port, sockets::AddrFamily::V4).unwrap();
        let accepted = unsafe { libc::accept(lfd, std::ptr::null_mut(), std::ptr::null_mut()) };
        assert!(accepted >= 0);
        sockets::close_socket(lfd);
        (StreamHandler::new(accepted).unwrap(), client)
    }

    #[test]
    pub fn test_read_loop_sizing() {
        let (mut stream, client) = loopback_stream();
        stream.configure_read(ReceivePolicy::Exactly(8));
        assert_eq!(stream.rd_buf.len(), 8);
        assert_eq!(stream.read_threshold, 8);
        stream.configure_read(ReceivePolicy::AtLeast(200));
        assert_eq!(stream.rd_buf.len(), 300);
        assert_eq!(stream.read_threshold, 200);
        sockets::close_socket(client);
    }

    #[test]
    pub fn test_offline_buffer_accumulates() {
        let (mut stream, client) = loopback_stream();
        stream.write(b"abc");
        stream.write(b"def");
        assert_eq!(stream.pending_write_bytes(), 6);
        assert!(!stream.is_writing());
        sockets::close_socket(client);
    }

    #[test]
    pub fn test_removed_from_loop_clears_direction() {
        struct Nop;
        impl StreamManager for Nop {
            fn consume(&mut self, _ctx: &mut StreamContext<'_>, _buf: &[u8]) {}
        }
        let (mut stream, client) = loopback_stream();
        let mgr: Rc<RefCell<dyn StreamManager>> = Rc::new(RefCell::new(Nop));
        stream.set_reader(Rc::clone(&mgr));
        stream.writer = Some(mgr);
        stream.removed_from_loop(Operation::Read);
        assert!(stream.reader.is_none());
        assert!(stream.writer.is_some());
        stream.removed_from_loop(Operation::Write);
        assert!(stream.writer.is_none());
        assert!(!stream.is_writing());
        sockets::close_socket(client);
    }
}
