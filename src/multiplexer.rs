//! The reactor core: a registration arena keyed by fd, a pending-change
//! queue applied at iteration boundaries, the event loop, and the wake
//! pipe other threads use to inject resumable tasks.

use crate::acceptor::{Acceptor, AcceptorManager};
use crate::dbglog;
use crate::event::{EventMask, Operation, PollEvent};
use crate::logmsg;
use crate::sockets::{self, AddrFamily, NetResult, NetworkError, SocketGuard};
use crate::stream::{ReceivePolicy, StreamHandler, StreamManager};
use crate::task::{recv_transit, send_transit, PipeFd, Resumable, ResumeResult, Scheduler, TaskKind};
use crate::Poller;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A registration change recorded while dispatch is running and applied in
/// a batch at the end of the iteration. `handler` carries a freshly
/// adopted handler on its way into the arena.
pub(crate) struct PendingEvent {
    pub fd: RawFd,
    pub mask: EventMask,
    pub handler: Option<SocketHandler>,
}

/// The three closed handler kinds the loop dispatches to.
pub(crate) enum SocketHandler {
    Stream(StreamHandler),
    Acceptor(Acceptor),
    PipeReader(crate::handler::HandlerBase),
}

impl SocketHandler {
    fn base(&self) -> &crate::handler::HandlerBase {
        match self {
            SocketHandler::Stream(s) => &s.base,
            SocketHandler::Acceptor(a) => &a.base,
            SocketHandler::PipeReader(b) => b,
        }
    }
    fn base_mut(&mut self) -> &mut crate::handler::HandlerBase {
        match self {
            SocketHandler::Stream(s) => &mut s.base,
            SocketHandler::Acceptor(a) => &mut a.base,
            SocketHandler::PipeReader(b) => b,
        }
    }
    /// A direction left the interest set; drop that side's manager
    /// reference.
    fn removed_from_loop(&mut self, op: Operation) {
        match self {
            SocketHandler::Stream(s) => s.removed_from_loop(op),
            SocketHandler::Acceptor(a) => {
                if op == Operation::Read {
                    a.mgr = None;
                }
            }
            SocketHandler::PipeReader(_) => {}
        }
    }
}

/// Where handlers and manager callbacks record registration changes and
/// task dispatches while the loop is mid-iteration.
pub(crate) struct OpsSink<'a> {
    pub pending: &'a mut Vec<PendingEvent>,
    pub wake: &'a LoopHandle,
}

impl OpsSink<'_> {
    pub fn reborrow(&mut self) -> OpsSink<'_> {
        OpsSink {
            pending: &mut *self.pending,
            wake: self.wake,
        }
    }

    /// Requests for the same fd within one batch coalesce onto the latest
    /// recorded mask; `committed` seeds the first request.
    fn change(&mut self, fd: RawFd, committed: EventMask, f: impl FnOnce(EventMask) -> EventMask) {
        let current = self
            .pending
            .iter()
            .rev()
            .find(|ev| ev.fd == fd)
            .map(|ev| ev.mask)
            .unwrap_or(committed);
        self.pending.push(PendingEvent {
            fd,
            mask: f(current),
            handler: None,
        });
    }

    pub fn add(&mut self, fd: RawFd, committed: EventMask, op: Operation) {
        self.change(fd, committed, |mask| mask.with(EventMask::of(op)));
    }

    pub fn del(&mut self, fd: RawFd, committed: EventMask, op: Operation) {
        self.change(fd, committed, |mask| mask.without(EventMask::of(op)));
    }

    /// Stage a freshly built handler for arena insertion plus its first
    /// registration.
    pub fn adopt(&mut self, handler: SocketHandler, mask: EventMask) {
        debug_assert!(handler.base().mask.is_empty());
        self.pending.push(PendingEvent {
            fd: handler.base().fd,
            mask,
            handler: Some(handler),
        });
    }

    pub fn exec_later(&self, task: Arc<dyn Resumable>) {
        self.wake.exec_later(task);
    }
}

struct WakePipe {
    wr: RawFd,
    closed: AtomicBool,
}

/// Cloneable, `Send` handle over the wake pipe: the one cross-thread entry
/// point into the loop.
#[derive(Clone)]
pub struct LoopHandle {
    pipe: Arc<WakePipe>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl LoopHandle {
    /// Route a task: actor- and action-kind tasks travel through the wake
    /// pipe; background tasks go to the external scheduler (or the pipe
    /// when none is attached).
    pub fn exec_later(&self, task: Arc<dyn Resumable>) {
        match task.kind() {
            TaskKind::IoActor | TaskKind::Action => self.push_pipe(task),
            TaskKind::Background => match &self.scheduler {
                Some(scheduler) => scheduler.enqueue(task),
                None => self.push_pipe(task),
            },
        }
    }

    /// Convenience: wrap a closure into an action task and enqueue it.
    pub fn dispatch<F>(&self, f: F)
    where
        F: Fn(&mut Multiplexer) + Send + Sync + 'static,
    {
        self.exec_later(crate::task::Action::new(f));
    }

    fn push_pipe(&self, task: Arc<dyn Resumable>) {
        // The closed flag catches the common post-shutdown case; the
        // remaining fd-reuse window matches what a raw pipe write has
        // always had.
        if self.pipe.closed.load(Ordering::Acquire) {
            return; // dropping the task releases the transit reference
        }
        send_transit(&PipeFd(self.pipe.wr), task);
    }
}

/// Scoped ownership of the loop. Dropping the supervisor dispatches one
/// closure onto the loop that deregisters the wake pipe, which is the
/// termination signal for `run()`.
pub struct Supervisor {
    handle: LoopHandle,
    pipe_rd: RawFd,
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let fd = self.pipe_rd;
        self.handle.dispatch(move |mux| mux.del(Operation::Read, fd));
    }
}

/// Single-threaded event-driven I/O multiplexer. Owns the readiness back
/// end, the handler arena and the wake pipe; everything except
/// `LoopHandle` runs on the loop thread.
pub struct Multiplexer {
    backend: Poller,
    handlers: BTreeMap<RawFd, SocketHandler>,
    pending: Vec<PendingEvent>,
    ready: Vec<PollEvent>,
    pipe_rd: RawFd,
    handle: LoopHandle,
    shutting_down: bool,
}

impl Multiplexer {
    pub fn new() -> io::Result<Self> {
        Self::with_scheduler(None)
    }

    pub fn with_scheduler(scheduler: Option<Arc<dyn Scheduler>>) -> io::Result<Self> {
        let mut backend = Poller::new()?;
        let (pipe_rd, pipe_wr) = sockets::new_pipe()?;
        let handle = LoopHandle {
            pipe: Arc::new(WakePipe {
                wr: pipe_wr,
                closed: AtomicBool::new(false),
            }),
            scheduler,
        };
        // the pipe reader is registered before anything else and stays
        // until shutdown deregisters it
        let mut base = crate::handler::HandlerBase::wrap(pipe_rd);
        backend.apply(pipe_rd, EventMask::NONE, EventMask::READ);
        base.mask = EventMask::READ;
        let mut handlers = BTreeMap::new();
        handlers.insert(pipe_rd, SocketHandler::PipeReader(base));
        Ok(Self {
            backend,
            handlers,
            pending: Vec::new(),
            ready: Vec::new(),
            pipe_rd,
            handle,
            shutting_down: false,
        })
    }

    /// Cross-thread handle for `exec_later`/`dispatch`.
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn exec_later(&self, task: Arc<dyn Resumable>) {
        self.handle.exec_later(task);
    }

    pub fn dispatch<F>(&self, f: F)
    where
        F: Fn(&mut Multiplexer) + Send + Sync + 'static,
    {
        self.handle.dispatch(f);
    }

    pub fn make_supervisor(&self) -> Supervisor {
        Supervisor {
            handle: self.handle.clone(),
            pipe_rd: self.pipe_rd,
        }
    }

    /// Registered-fd count as the back end sees it.
    pub fn count_registered(&self) -> usize {
        self.backend.registered()
    }

    /// Handlers in the arena, the pipe reader included.
    pub fn count_handlers(&self) -> usize {
        self.handlers.len()
    }

    pub fn count_streams(&self) -> usize {
        self.handlers
            .values()
            .filter(|h| matches!(h, SocketHandler::Stream(_)))
            .count()
    }

    //------------------------------------------------------------------
    //            interest changes
    //------------------------------------------------------------------

    /// Request that `op` be added to the interest mask of `fd`. Applied at
    /// the iteration boundary, never synchronously.
    pub fn add(&mut self, op: Operation, fd: RawFd) {
        self.request_change(fd, |mask| mask.with(EventMask::of(op)));
    }

    /// Request that `op` be removed from the interest mask of `fd`. A
    /// handler whose mask empties leaves the arena.
    pub fn del(&mut self, op: Operation, fd: RawFd) {
        self.request_change(fd, |mask| mask.without(EventMask::of(op)));
    }

    fn request_change(&mut self, fd: RawFd, f: impl FnOnce(EventMask) -> EventMask) {
        let Self {
            handlers,
            pending,
            handle,
            ..
        } = self;
        let Some(handler) = handlers.get(&fd) else {
            logmsg!("interest change for unknown fd {}", fd);
            return;
        };
        let mut ops = OpsSink {
            pending,
            wake: handle,
        };
        ops.change(fd, handler.base().mask, f);
    }

    //------------------------------------------------------------------
    //            factories
    //------------------------------------------------------------------

    /// Connect to `host:port` and adopt the connection as a stream read by
    /// `mgr` under `policy`. Returns the fd handle.
    pub fn start_connect(
        &mut self,
        host: &str,
        port: u16,
        preferred: AddrFamily,
        policy: ReceivePolicy,
        mgr: Rc<RefCell<dyn StreamManager>>,
    ) -> NetResult<RawFd> {
        let fd = sockets::new_tcp_connection(host, port, preferred)?;
        self.adopt_stream(fd, policy, mgr)
            .map_err(|err| NetworkError::wrap("adopt connected socket", err))
    }

    /// Wrap an established fd into a stream handler and schedule its read
    /// registration.
    pub fn adopt_stream(
        &mut self,
        fd: RawFd,
        policy: ReceivePolicy,
        mgr: Rc<RefCell<dyn StreamManager>>,
    ) -> io::Result<RawFd> {
        let guard = SocketGuard::new(fd);
        let mut stream = StreamHandler::new(guard.get())?;
        let fd = guard.release();
        stream.configure_read(policy);
        stream.set_reader(mgr);
        if self
            .handlers
            .insert(fd, SocketHandler::Stream(stream))
            .is_some()
        {
            logmsg!("fd {} was still in the arena, replacing stale handler", fd);
        }
        self.add(Operation::Read, fd);
        Ok(fd)
    }

    /// Bind and listen, then adopt the listener for `mgr`. Returns the
    /// listener fd and the actually bound port (ephemeral binds report the
    /// assigned port).
    pub fn start_listen(
        &mut self,
        port: u16,
        addr: Option<&str>,
        reuse_addr: bool,
        mgr: Rc<RefCell<dyn AcceptorManager>>,
    ) -> NetResult<(RawFd, u16)> {
        let (fd, bound_port) = sockets::new_tcp_acceptor(port, addr, reuse_addr)?;
        let guard = SocketGuard::new(fd);
        let mut acceptor = Acceptor::new(guard.get())
            .map_err(|err| NetworkError::wrap("adopt listening socket", err))?;
        let fd = guard.release();
        acceptor.mgr = Some(mgr);
        if self
            .handlers
            .insert(fd, SocketHandler::Acceptor(acceptor))
            .is_some()
        {
            logmsg!("fd {} was still in the arena, replacing stale handler", fd);
        }
        self.add(Operation::Read, fd);
        Ok((fd, bound_port))
    }

    //------------------------------------------------------------------
    //            per-stream surface (addressed by fd)
    //------------------------------------------------------------------

    /// Queue bytes on a stream's offline buffer. Returns false when `fd`
    /// is not a stream in the arena.
    pub fn write(&mut self, fd: RawFd, buf: &[u8]) -> bool {
        self.with_stream(fd, |stream, _ops| stream.write(buf))
    }

    /// Idempotent flush; `mgr` becomes the write-side manager.
    pub fn flush(&mut self, fd: RawFd, mgr: &Rc<RefCell<dyn StreamManager>>) -> bool {
        self.with_stream(fd, |stream, ops| stream.flush(mgr, ops))
    }

    pub fn configure_read(&mut self, fd: RawFd, policy: ReceivePolicy) -> bool {
        self.with_stream(fd, |stream, _ops| stream.configure_read(policy))
    }

    pub fn ack_writes(&mut self, fd: RawFd, enable: bool) -> bool {
        self.with_stream(fd, |stream, _ops| stream.ack_writes(enable))
    }

    /// Half-shut the read side and deregister read interest; queued writes
    /// keep draining.
    pub fn stop_reading(&mut self, fd: RawFd) -> bool {
        self.with_stream(fd, |stream, ops| stream.stop_reading(ops))
    }

    fn with_stream(
        &mut self,
        fd: RawFd,
        f: impl FnOnce(&mut StreamHandler, &mut OpsSink<'_>),
    ) -> bool {
        let Self {
            handlers,
            pending,
            handle,
            ..
        } = self;
        match handlers.get_mut(&fd) {
            Some(SocketHandler::Stream(stream)) => {
                let mut ops = OpsSink {
                    pending,
                    wake: handle,
                };
                f(stream, &mut ops);
                true
            }
            _ => {
                logmsg!("no stream in the arena for fd {}", fd);
                false
            }
        }
    }

    //------------------------------------------------------------------
    //            the loop
    //------------------------------------------------------------------

    /// Block dispatching events until the supervisor deregisters the wake
    /// pipe or no registrations remain.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.shutting_down && self.backend.registered() > 0 {
            self.poll_once(true)?;
        }
        Ok(())
    }

    /// One loop iteration: apply staged changes, wait (indefinitely when
    /// `block`, otherwise just poll), dispatch every ready fd, then apply
    /// the changes the dispatch requested. Returns the number of events
    /// dispatched.
    pub fn poll_once(&mut self, block: bool) -> io::Result<usize> {
        self.apply_pending();
        if self.shutting_down || self.backend.registered() == 0 {
            return Ok(0);
        }
        let mut ready = mem::take(&mut self.ready);
        ready.clear();
        let timeout_ms = if block { -1 } else { 0 };
        if let Err(err) = self.backend.wait(&mut ready, timeout_ms) {
            self.ready = ready;
            return Err(err);
        }
        let count = ready.len();
        for ev in &ready {
            if ev.fd == self.pipe_rd {
                self.handle_pipe_event(ev.mask);
            } else {
                self.dispatch_event(ev.fd, ev.mask);
            }
        }
        ready.clear();
        self.ready = ready;
        self.apply_pending();
        Ok(count)
    }

    /// Dispatch one ready socket. POSIX delivers hangups together with the
    /// final readable data, so an error-only event is the only case that
    /// tears a handler down here; handling a read or write clears the
    /// error check instead of double-reporting it.
    fn dispatch_event(&mut self, fd: RawFd, mask: EventMask) {
        let Self {
            handlers,
            pending,
            handle,
            ..
        } = self;
        let Some(handler) = handlers.get_mut(&fd) else {
            dbglog!("event {} for already removed fd {}", mask, fd);
            return;
        };
        let mut ops = OpsSink {
            pending,
            wake: handle,
        };
        match handler {
            SocketHandler::Stream(stream) => {
                let mut check_error = mask.has_error();
                if mask.readable() {
                    // a closed read channel suppresses the callback, never
                    // the error-check clearing
                    check_error = false;
                    if !stream.base.read_closed {
                        stream.handle_read_event(&mut ops);
                    }
                }
                if mask.writable() {
                    check_error = false;
                    stream.handle_write_event(&mut ops);
                }
                if check_error {
                    stream.fail(Operation::Read, &mut ops);
                    stream.fail(Operation::Write, &mut ops);
                }
            }
            SocketHandler::Acceptor(acceptor) => {
                if mask.readable() {
                    acceptor.handle_read_event(&mut ops);
                } else if mask.has_error() {
                    acceptor.fail(&mut ops);
                }
            }
            SocketHandler::PipeReader(_) => {} // dispatched before this point
        }
    }

    /// Drain one task pointer per readable event (level-triggered: the
    /// next iteration re-fires while more are queued) and resume it with
    /// the full multiplexer at hand.
    fn handle_pipe_event(&mut self, mask: EventMask) {
        if mask.readable() {
            if let Some(task) = self.read_task() {
                match task.resume(self) {
                    ResumeResult::Later => self.handle.exec_later(task),
                    // Done and Parked both release the transit reference;
                    // a parked task stays alive through its owner's clones
                    ResumeResult::Done | ResumeResult::Parked => {}
                }
            }
        } else if mask.has_error() {
            logmsg!("wake pipe signalled an error, shutting the loop down");
            self.del(Operation::Read, self.pipe_rd);
        }
    }

    fn read_task(&mut self) -> Option<Arc<dyn Resumable>> {
        recv_transit(&PipeFd(self.pipe_rd))
    }

    /// Apply every staged registration change in insertion order, then
    /// reconcile handler lifetimes: a direction that left the mask drops
    /// its manager reference, an emptied mask drops the handler (closing
    /// its fd), and an emptied pipe registration flags shutdown.
    fn apply_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = mem::take(&mut self.pending);
        for ev in pending {
            if let Some(handler) = ev.handler {
                if self.handlers.insert(ev.fd, handler).is_some() {
                    logmsg!("fd {} was still in the arena, replacing stale handler", ev.fd);
                }
            }
            let Some(handler) = self.handlers.get_mut(&ev.fd) else {
                dbglog!("stale interest change for fd {}", ev.fd);
                continue;
            };
            let old = handler.base().mask;
            if old == ev.mask {
                continue;
            }
            self.backend.apply(ev.fd, old, ev.mask);
            handler.base_mut().mask = ev.mask;
            if old.readable() && !ev.mask.readable() {
                handler.removed_from_loop(Operation::Read);
            }
            if old.writable() && !ev.mask.writable() {
                handler.removed_from_loop(Operation::Write);
            }
            if ev.mask.is_empty() {
                if ev.fd == self.pipe_rd {
                    self.shutting_down = true;
                    self.handlers.remove(&ev.fd); // the pipe fd stays open for the drain
                } else if let Some(gone) = self.handlers.remove(&ev.fd) {
                    if let SocketHandler::Stream(stream) = &gone {
                        logmsg!(
                            "removing stream fd {}, unsent bytes: {}",
                            ev.fd,
                            stream.pending_write_bytes()
                        );
                    } else {
                        logmsg!("removing fd {}", ev.fd);
                    }
                    // dropping the handler closes the fd
                }
            }
        }
        debug_assert_eq!(
            self.backend.registered(),
            self.handlers
                .values()
                .filter(|h| !h.base().mask.is_empty())
                .count(),
            "shadow registrations must match the arena at iteration boundaries"
        );
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        // refuse new cross-thread tasks, then drain the ones in transit so
        // every reference is released exactly once
        self.handle.pipe.closed.store(true, Ordering::Release);
        let _ = sockets::set_nonblocking(self.pipe_rd);
        while let Some(task) = self.read_task() {
            drop(task);
        }
        sockets::close_socket(self.pipe_rd);
        sockets::close_socket(self.handle.pipe.wr);
        // the arena drops after this body, closing every remaining socket
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn test_new_registers_wake_pipe() {
        let mux = Multiplexer::new().unwrap();
        assert_eq!(mux.count_registered(), 1);
        assert_eq!(mux.count_handlers(), 1);
        assert_eq!(mux.count_streams(), 0);
    }

    #[test]
    pub fn test_unknown_fd_is_logged_not_fatal() {
        let mut mux = Multiplexer::new().unwrap();
        mux.add(Operation::Write, 9999);
        mux.del(Operation::Read, 9999);
        assert!(!mux.write(9999, b"x"));
        mux.poll_once(false).unwrap();
        assert_eq!(mux.count_registered(), 1);
    }

    #[test]
    pub fn test_del_pipe_terminates_run() {
        let mut mux = Multiplexer::new().unwrap();
        let pipe_rd = mux.pipe_rd;
        mux.del(Operation::Read, pipe_rd);
        mux.run().unwrap();
        assert_eq!(mux.count_registered(), 0);
        assert_eq!(mux.count_handlers(), 0);
    }

    #[test]
    pub fn test_pending_requests_coalesce_per_fd() {
        let mut pending = Vec::new();
        let mux = Multiplexer::new().unwrap();
        let mut ops = OpsSink {
            pending: &mut pending,
            wake: &mux.handle,
        };
        ops.add(7, EventMask::NONE, Operation::Read);
        ops.add(7, EventMask::NONE, Operation::Write);
        ops.del(7, EventMask::NONE, Operation::Read);
        // each request starts from the latest recorded mask, not the
        // committed one
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].mask, EventMask::READ);
        assert_eq!(pending[1].mask, EventMask::READ | EventMask::WRITE);
        assert_eq!(pending[2].mask, EventMask::WRITE);
    }

    #[test]
    pub fn test_shutdown_drain_releases_tasks() {
        struct Nop;
        impl Resumable for Nop {
            fn resume(&self, _mux: &mut Multiplexer) -> ResumeResult {
                ResumeResult::Done
            }
        }
        let mux = Multiplexer::new().unwrap();
        let task = Arc::new(Nop);
        for _ in 0..16 {
            mux.exec_later(task.clone());
        }
        assert_eq!(Arc::strong_count(&task), 17);
        drop(mux); // never polled: the drain must release all 16 transits
        assert_eq!(Arc::strong_count(&task), 1);
    }
}
