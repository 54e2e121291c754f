//! Resumable tasks and their transit through the wake pipe. A task crosses
//! threads as the thin pointer of a boxed `Arc`; pointer-sized pipe writes
//! are atomic (`PIPE_BUF`), so concurrent writers never interleave bytes.

use crate::logmsg;
use crate::multiplexer::Multiplexer;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// What `resume` reports back to the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeResult {
    /// Finished; the transit reference is released.
    Done,
    /// Wants another slice; re-enqueued through `exec_later`.
    Later,
    /// Parked elsewhere (e.g. awaiting a message). The loop lets go of its
    /// transit reference; the owner's own handles keep the task alive.
    Parked,
}

/// Routing class for `exec_later`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// An I/O-bound actor; travels through the wake pipe.
    IoActor,
    /// A plain function object; travels through the wake pipe.
    Action,
    /// Anything else; handed to the external scheduler.
    Background,
}

/// A reference-counted unit of work other threads may inject into the
/// loop. Resumed on the loop thread with full access to the multiplexer.
pub trait Resumable: Send + Sync {
    fn kind(&self) -> TaskKind {
        TaskKind::Action
    }

    fn resume(&self, mux: &mut Multiplexer) -> ResumeResult;
}

/// Closure adapter: `exec_later(Action::new(|mux| ...))`.
pub struct Action<F>(F);

impl<F> Action<F>
where
    F: Fn(&mut Multiplexer) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self(f))
    }
}

impl<F> Resumable for Action<F>
where
    F: Fn(&mut Multiplexer) + Send + Sync,
{
    fn resume(&self, mux: &mut Multiplexer) -> ResumeResult {
        (self.0)(mux);
        ResumeResult::Done
    }
}

/// Seam to the external actor scheduler; `Background` tasks are handed to
/// it instead of the pipe. Thread safety of `enqueue` is the scheduler's
/// concern.
pub trait Scheduler: Send + Sync {
    fn enqueue(&self, task: Arc<dyn Resumable>);
}

/// In-transit representation: a thin pointer to the boxed reference.
/// Keeps the refcount >= 1 for the whole crossing; released exactly once
/// on the receiving side (resume, closed pipe, or shutdown drain).
pub(crate) type TransitPtr = *mut Arc<dyn Resumable>;

pub(crate) fn into_transit(task: Arc<dyn Resumable>) -> TransitPtr {
    Box::into_raw(Box::new(task))
}

/// Safety: `ptr` must come from `into_transit` and be consumed only once.
pub(crate) unsafe fn from_transit(ptr: TransitPtr) -> Arc<dyn Resumable> {
    *Box::from_raw(ptr)
}

/// The raw byte channel under the wake pipe. Production is one end of the
/// pipe; tests substitute a transport that misbehaves to drive the abort
/// path of a torn pointer write.
pub(crate) trait PipeTransport {
    /// One write(2)-shaped attempt; the raw result, EINTR already retried.
    fn write_bytes(&self, buf: &[u8]) -> isize;
    /// One read(2)-shaped attempt; the raw result, EINTR already retried.
    fn read_bytes(&self, buf: &mut [u8]) -> isize;
}

/// One end of the wake pipe.
pub(crate) struct PipeFd(pub RawFd);

impl PipeTransport for PipeFd {
    fn write_bytes(&self, buf: &[u8]) -> isize {
        loop {
            let n = unsafe { libc::write(self.0, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if n < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return n as isize;
        }
    }

    fn read_bytes(&self, buf: &mut [u8]) -> isize {
        loop {
            let n =
                unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return n as isize;
        }
    }
}

/// Verdict on one pipe write of a transit pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipeWriteOutcome {
    Delivered,
    /// `write` returned <= 0: the pipe is closed, release the task.
    ClosedPipe,
    /// A partial pointer write would corrupt the byte stream beyond
    /// repair; the process must abort.
    Fatal,
}

pub(crate) fn classify_pipe_write(result: isize, expected: usize) -> PipeWriteOutcome {
    if result == expected as isize {
        PipeWriteOutcome::Delivered
    } else if result <= 0 {
        PipeWriteOutcome::ClosedPipe
    } else {
        PipeWriteOutcome::Fatal
    }
}

/// Push one transit pointer through `transport`. Returns false when the
/// pipe is closed (the task was released). A short write is fatal: the
/// diagnostic goes to stderr and the process aborts.
pub(crate) fn send_transit(transport: &impl PipeTransport, task: Arc<dyn Resumable>) -> bool {
    let want = mem::size_of::<TransitPtr>();
    let ptr = into_transit(task);
    let buf = (ptr as usize).to_ne_bytes();
    let n = transport.write_bytes(&buf);
    match classify_pipe_write(n, want) {
        PipeWriteOutcome::Delivered => true,
        PipeWriteOutcome::ClosedPipe => {
            unsafe {
                drop(from_transit(ptr));
            }
            false
        }
        PipeWriteOutcome::Fatal => {
            eprintln!("muxio: fatal short write on wake pipe ({} of {} bytes)", n, want);
            std::process::abort();
        }
    }
}

/// Pull one transit pointer from `transport`. `None` on would-block or a
/// closed write side. Atomic pointer-sized writes make a split read
/// impossible on an intact pipe; anything partial is corruption and
/// aborts.
pub(crate) fn recv_transit(transport: &impl PipeTransport) -> Option<Arc<dyn Resumable>> {
    let want = mem::size_of::<TransitPtr>();
    let mut buf = [0u8; mem::size_of::<usize>()];
    let n = transport.read_bytes(&mut buf);
    if n == want as isize {
        return Some(unsafe { from_transit(usize::from_ne_bytes(buf) as TransitPtr) });
    }
    if n == 0 {
        return None; // write side gone
    }
    if n < 0 {
        let err = io::Error::last_os_error();
        let errno = err.raw_os_error();
        if errno == Some(libc::EAGAIN) || errno == Some(libc::EWOULDBLOCK) {
            return None;
        }
        logmsg!("wake pipe read failed: {}", err);
        return None;
    }
    eprintln!("muxio: fatal short read on wake pipe ({} of {} bytes)", n, want);
    std::process::abort();
}

#[cfg(test)]
mod test {
    use super::*;
    use std::mem::size_of;

    struct Nop;
    impl Resumable for Nop {
        fn resume(&self, _mux: &mut Multiplexer) -> ResumeResult {
            ResumeResult::Done
        }
    }

    /// Transport that claims a torn 3-byte transfer on every call.
    struct ShortPipe;
    impl PipeTransport for ShortPipe {
        fn write_bytes(&self, _buf: &[u8]) -> isize {
            3
        }
        fn read_bytes(&self, _buf: &mut [u8]) -> isize {
            3
        }
    }

    #[test]
    pub fn test_classify_pipe_write() {
        let want = size_of::<TransitPtr>();
        assert_eq!(
            classify_pipe_write(want as isize, want),
            PipeWriteOutcome::Delivered
        );
        assert_eq!(classify_pipe_write(0, want), PipeWriteOutcome::ClosedPipe);
        assert_eq!(classify_pipe_write(-1, want), PipeWriteOutcome::ClosedPipe);
        // a short write of a pointer is unrecoverable
        assert_eq!(classify_pipe_write(3, want), PipeWriteOutcome::Fatal);
        assert_eq!(
            classify_pipe_write(want as isize - 1, want),
            PipeWriteOutcome::Fatal
        );
    }

    #[test]
    pub fn test_transit_keeps_refcount() {
        let task: Arc<dyn Resumable> = Arc::new(Nop);
        let keeper = Arc::clone(&task);
        let ptr = into_transit(task);
        assert_eq!(Arc::strong_count(&keeper), 2);
        let back = unsafe { from_transit(ptr) };
        assert_eq!(Arc::strong_count(&keeper), 2);
        drop(back);
        assert_eq!(Arc::strong_count(&keeper), 1);
    }

    #[test]
    pub fn test_transit_roundtrip_over_real_pipe() {
        let (rd, wr) = crate::sockets::new_pipe().unwrap();
        let task: Arc<dyn Resumable> = Arc::new(Nop);
        let keeper = Arc::clone(&task);
        assert!(send_transit(&PipeFd(wr), task));
        assert_eq!(Arc::strong_count(&keeper), 2);
        let back = recv_transit(&PipeFd(rd)).expect("pointer must round-trip");
        drop(back);
        assert_eq!(Arc::strong_count(&keeper), 1);
        crate::sockets::close_socket(rd);
        crate::sockets::close_socket(wr);
    }

    #[test]
    pub fn test_closed_pipe_releases_task() {
        struct ClosedPipe;
        impl PipeTransport for ClosedPipe {
            fn write_bytes(&self, _buf: &[u8]) -> isize {
                -1
            }
            fn read_bytes(&self, _buf: &mut [u8]) -> isize {
                0
            }
        }
        let task: Arc<dyn Resumable> = Arc::new(Nop);
        let keeper = Arc::clone(&task);
        assert!(!send_transit(&ClosedPipe, task));
        // the transit reference came back exactly once
        assert_eq!(Arc::strong_count(&keeper), 1);
        assert!(recv_transit(&ClosedPipe).is_none());
    }

    // The abort paths kill the calling process, so they run in a child:
    // the test re-executes its own binary filtered down to itself, with an
    // env marker switching the child onto the doomed branch.

    fn run_doomed_child(test_name: &str, marker: &str) -> std::process::Output {
        let exe = std::env::current_exe().unwrap();
        std::process::Command::new(exe)
            .args([test_name, "--exact", "--nocapture"])
            .env(marker, "1")
            .output()
            .unwrap()
    }

    #[test]
    pub fn test_short_write_aborts_process() {
        if std::env::var("MUXIO_FORCE_SHORT_PIPE_WRITE").is_ok() {
            send_transit(&ShortPipe, Arc::new(Nop));
            // only reachable when the abort path is broken
            std::process::exit(0);
        }
        let output = run_doomed_child(
            "task::test::test_short_write_aborts_process",
            "MUXIO_FORCE_SHORT_PIPE_WRITE",
        );
        assert!(
            !output.status.success(),
            "a short pipe write must abort the process"
        );
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(
            stderr.contains("short write on wake pipe"),
            "missing abort diagnostic, child stderr: {}",
            stderr
        );
    }

    #[test]
    pub fn test_short_read_aborts_process() {
        if std::env::var("MUXIO_FORCE_SHORT_PIPE_READ").is_ok() {
            let _ = recv_transit(&ShortPipe);
            std::process::exit(0);
        }
        let output = run_doomed_child(
            "task::test::test_short_read_aborts_process",
            "MUXIO_FORCE_SHORT_PIPE_READ",
        );
        assert!(
            !output.status.success(),
            "a short pipe read must abort the process"
        );
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(
            stderr.contains("short read on wake pipe"),
            "missing abort diagnostic, child stderr: {}",
            stderr
        );
    }
}
