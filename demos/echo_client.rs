use muxio::{
    logmsg, AddrFamily, Multiplexer, Operation, ReceivePolicy, StreamContext, StreamManager,
};
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

const MAX_ECHOS: usize = 5;

/// Sends one message, then bounces every reply until the echo budget is
/// spent and the read side stops.
struct EchoCounter {
    count: usize,
}

impl StreamManager for EchoCounter {
    fn consume(&mut self, ctx: &mut StreamContext<'_>, buf: &[u8]) {
        self.count += 1;
        logmsg!(
            "echo {}: {} bytes: {}",
            self.count,
            buf.len(),
            String::from_utf8_lossy(buf)
        );
        if self.count >= MAX_ECHOS {
            ctx.stop_reading();
            return;
        }
        ctx.write(buf);
        ctx.flush();
    }

    fn io_failure(&mut self, fd: RawFd, op: Operation) {
        logmsg!("fd {} closed ({:?})", fd, op);
    }
}

fn run(port: u16) {
    let mut mux = Multiplexer::new().unwrap();
    let counter = Rc::new(RefCell::new(EchoCounter { count: 0 }));
    let mgr: Rc<RefCell<dyn StreamManager>> = counter.clone();
    let fd = mux
        .start_connect(
            "127.0.0.1",
            port,
            AddrFamily::V4,
            ReceivePolicy::AtMost(1024),
            Rc::clone(&mgr),
        )
        .unwrap();
    logmsg!("connected to 127.0.0.1:{}, fd {}", port, fd);

    mux.write(fd, b"hello echo");
    mux.flush(fd, &mgr);

    let timer = muxio::utils::Timer::new_millis(10_000);
    while counter.borrow().count < MAX_ECHOS && mux.count_streams() > 0 {
        if timer.expired() {
            logmsg!("timeout waiting for echos");
            break;
        }
        mux.poll_once(false).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    logmsg!("client done after {} echos", counter.borrow().count);
}

fn main() {
    run(10254);
}
