extern crate libc;
use std::io::Write;
use std::time::{Duration, Instant};

pub fn localtime_r(seconds: i64, tm: &mut libc::tm) {
    let t = seconds as libc::time_t;
    unsafe {
        libc::localtime_r(&t, tm);
    }
}

/// Format nanos-since-epoch as `YYYYMMDD-HH:MM:SS.uuuuuu` into `buffer`.
/// `buffer` must hold at least 24 bytes.
pub fn format_time(buffer: &mut [u8], nownanos: i64) -> &str {
    debug_assert!(buffer.len() >= 24);
    let (seconds, nanos) = (nownanos / 1_000_000_000, nownanos % 1_000_000_000);
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    localtime_r(seconds, &mut tm);
    write!(
        &mut buffer[..],
        "{:04}{:02}{:02}-{:02}:{:02}:{:02}.{:06}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec,
        nanos / 1000
    )
    .unwrap();
    std::str::from_utf8(&buffer[..24]).unwrap()
}

pub fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as i64
}

/// Deadline helper for pump loops: `while !timer.expired() { ... }`.
pub struct Timer {
    deadline: Instant,
}

impl Timer {
    pub fn new_millis(millis: u64) -> Self {
        Self {
            deadline: Instant::now() + Duration::from_millis(millis),
        }
    }
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[macro_export]
macro_rules! logmsg {
    ($( $args:expr ),*) => {
        let mut buf = [0u8; 40];
        print!("[{}] ", $crate::utils::format_time(&mut buf, $crate::utils::now_nanos()));
        println!( $( $args ),* );
    }
}

#[macro_export]
/// log only in debug mode.
#[cfg(debug_assertions)]
macro_rules! dbglog {
    ($( $args:expr ),*) => {
        let mut buf = [0u8; 40];
        print!("[{}] [DBG] ", $crate::utils::format_time(&mut buf, $crate::utils::now_nanos()));
        println!( $( $args ),* );
    }
}
#[allow(unused_macros)]
#[macro_export]
#[cfg(not(debug_assertions))]
macro_rules! dbglog {
    ($( $args:expr ),*) => {
        ()
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn test_format_time() {
        let mut buf = [0u8; 40];
        let s = format_time(&mut buf, now_nanos());
        assert_eq!(s.len(), 24);
        assert_eq!(&s[8..9], "-");
        logmsg!("formatted: {}", s);
        dbglog!("dbg variant prints only in debug builds.");
    }

    #[test]
    pub fn test_timer() {
        let timer = Timer::new_millis(0);
        std::thread::sleep(Duration::from_millis(1));
        assert!(timer.expired());
        let timer = Timer::new_millis(60_000);
        assert!(!timer.expired());
    }
}
