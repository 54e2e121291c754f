use muxio::{
    logmsg, AcceptContext, AcceptorManager, Multiplexer, ReceivePolicy, StreamContext,
    StreamManager,
};
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

/// Echoes every received batch back to its peer.
struct EchoBack;

impl StreamManager for EchoBack {
    fn consume(&mut self, ctx: &mut StreamContext<'_>, buf: &[u8]) {
        ctx.write(buf);
        ctx.flush();
    }

    fn io_failure(&mut self, fd: RawFd, op: muxio::Operation) {
        logmsg!("fd {} closed ({:?})", fd, op);
    }
}

struct EchoDoor {
    recv_buffer_size: usize,
}

impl AcceptorManager for EchoDoor {
    fn new_connection(&mut self, ctx: &mut AcceptContext<'_>) {
        logmsg!(
            "new connection from {:?}",
            ctx.remote_addr().map(|a| a.to_string())
        );
        let echo = Rc::new(RefCell::new(EchoBack));
        ctx.adopt(ReceivePolicy::AtMost(self.recv_buffer_size), echo)
            .unwrap();
    }
}

fn run(port: u16) {
    let mut mux = Multiplexer::new().unwrap();
    let door = Rc::new(RefCell::new(EchoDoor {
        recv_buffer_size: 1024,
    }));
    let (_fd, bound_port) = mux.start_listen(port, Some("127.0.0.1"), true, door).unwrap();
    logmsg!("echo server listening on 127.0.0.1:{}", bound_port);

    let supervisor = mux.make_supervisor();
    park_supervisor(supervisor);
    mux.run().unwrap();
    logmsg!("echo server done");
}

/// Park the supervisor on a thread that drops it after a long idle run;
/// a real deployment would tie it to its actor system's shutdown.
fn park_supervisor(supervisor: muxio::Supervisor) {
    std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_secs(3600));
        drop(supervisor);
    });
}

fn main() {
    run(10254);
}
