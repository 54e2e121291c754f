//! # Single-threaded event-driven TCP I/O multiplexer.
//!
//! Supported platforms: Linux (epoll), any POSIX system (poll).
//!
//! muxio is the I/O substrate for a concurrent-actor runtime: one thread
//! owns a set of nonblocking TCP endpoints and drives them off a readiness
//! primitive. Brokers ("managers") attach to streams and acceptors and get
//! called back with received byte batches, accepted connections and I/O
//! failures. Other threads inject work through a wake pipe carrying
//! reference-counted resumable tasks.
//!
//! - Interest changes (`add`/`del`) never touch the OS primitive while
//!   dispatch runs; they are staged and applied at iteration boundaries.
//! - A stream's receive policy (*exactly n*, *at most n*, *at least n*)
//!   decides when buffered bytes are delivered to its manager.
//! - The write side is a two-buffer pipeline: `write` appends offline,
//!   `flush` stages and registers write interest, writable events drain.
//! - `make_supervisor()` hands out a scoped guard; dropping it shuts the
//!   loop down after pending events are applied.
//!
//! ## Example
//!
//! ```rust,no_run
//! use muxio::{AcceptContext, AcceptorManager, Multiplexer, ReceivePolicy};
//! use muxio::{StreamContext, StreamManager};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! /// Echoes every received batch back to the peer.
//! struct Echo;
//! impl StreamManager for Echo {
//!     fn consume(&mut self, ctx: &mut StreamContext<'_>, buf: &[u8]) {
//!         ctx.write(buf);
//!         ctx.flush();
//!     }
//! }
//!
//! /// Adopts every accepted connection with an Echo manager.
//! struct Door;
//! impl AcceptorManager for Door {
//!     fn new_connection(&mut self, ctx: &mut AcceptContext<'_>) {
//!         let echo = Rc::new(RefCell::new(Echo));
//!         ctx.adopt(ReceivePolicy::AtMost(1024), echo).unwrap();
//!     }
//! }
//!
//! let mut mux = Multiplexer::new().unwrap();
//! let door = Rc::new(RefCell::new(Door));
//! let (_fd, port) = mux.start_listen(0, Some("127.0.0.1"), true, door).unwrap();
//! println!("echoing on port {port}");
//!
//! let supervisor = mux.make_supervisor();
//! std::thread::spawn(move || {
//!     std::thread::sleep(std::time::Duration::from_secs(5));
//!     drop(supervisor); // the termination signal for run()
//! });
//! mux.run().unwrap();
//! ```
//!
//! Cross-thread work: `mux.handle()` is `Send + Clone`; call
//! `handle.dispatch(|mux| ...)` or `handle.exec_later(task)` from any
//! thread and the closure runs on the loop thread.

#[cfg(not(unix))]
compile_error!("muxio targets Unix platforms (epoll or poll back end)");

mod acceptor;
mod event;
mod handler;
mod multiplexer;
mod sockets;
mod stream;
mod task;
pub mod utils;

#[cfg(all(feature = "epoll", target_os = "linux"))]
mod epoll;
#[cfg(all(feature = "epoll", target_os = "linux"))]
pub(crate) use epoll::Poller;

#[cfg(not(all(feature = "epoll", target_os = "linux")))]
mod poll;
#[cfg(not(all(feature = "epoll", target_os = "linux")))]
pub(crate) use poll::Poller;

pub use acceptor::{AcceptContext, AcceptorManager};
pub use event::{EventMask, Operation, PollEvent};
pub use multiplexer::{LoopHandle, Multiplexer, Supervisor};
pub use sockets::{
    accept_one, local_addr, local_port, new_tcp_acceptor, new_tcp_connection, read_some,
    remote_addr, remote_port, resolve_host, write_some, AddrFamily, NetResult, NetworkError,
    RwOutcome, SocketGuard, INVALID_SOCKET,
};
pub use stream::{ReceivePolicy, StreamContext, StreamManager};
pub use task::{Action, Resumable, ResumeResult, Scheduler, TaskKind};
