//! Provides an in-memory ring logger.
//!
//! A hosted engine has no serial port of its own and may not call back into the
//! host kernel's printk from arbitrary contexts, so records are formatted into a
//! fixed ring buffer that the host driver drains at its leisure. The ring is
//! guarded by a spin lock and never allocates while logging.

use {
    alloc::string::String,
    core::{
        fmt::{self, Write},
        sync::atomic::{AtomicBool, Ordering},
    },
    spin::Mutex,
};

/// Bytes retained before the oldest output is overwritten.
pub const LOG_RING_SIZE: usize = 64 * 1024;

static RING_LOGGER: RingLogger = RingLogger::new();
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Initialize the ring logger and install it as the global `log` logger.
///
/// This function is **idempotent**: calling it again only updates the global
/// max log level. If some other logger was registered first, the ring is still
/// reachable through [`global_logger`].
pub fn init(level: log::LevelFilter) {
    if !INSTALLED.swap(true, Ordering::AcqRel) {
        let _ = log::set_logger(&RING_LOGGER);
    }
    log::set_max_level(level);
}

/// The logger that implements `log::Log`.
pub struct RingLogger {
    ring: Mutex<LogRing>,
}

impl RingLogger {
    const fn new() -> Self {
        Self {
            ring: Mutex::new(LogRing::new()),
        }
    }

    /// Removes and returns everything logged since the previous drain.
    pub fn drain(&self) -> String {
        let mut ring = self.ring.lock();
        let (head, tail) = ring.as_slices();
        let mut out = String::from_utf8_lossy(head).into_owned();
        out.push_str(&String::from_utf8_lossy(tail));
        ring.clear();
        out
    }
}

impl log::Log for RingLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let core = apic_id();
            let mut ring = self.ring.lock();
            let _ = writeln!(&mut *ring, "cpu-{} {} {}: {}", core, record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Fixed-size byte ring; the oldest bytes are overwritten first.
struct LogRing {
    buffer: [u8; LOG_RING_SIZE],
    start: usize,
    len: usize,
}

impl LogRing {
    const fn new() -> Self {
        Self {
            buffer: [0; LOG_RING_SIZE],
            start: 0,
            len: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        let end = (self.start + self.len) % LOG_RING_SIZE;
        self.buffer[end] = byte;
        if self.len == LOG_RING_SIZE {
            self.start = (self.start + 1) % LOG_RING_SIZE;
        } else {
            self.len += 1;
        }
    }

    fn as_slices(&self) -> (&[u8], &[u8]) {
        let end = self.start + self.len;
        if end <= LOG_RING_SIZE {
            (&self.buffer[self.start..end], &[])
        } else {
            (&self.buffer[self.start..], &self.buffer[..end - LOG_RING_SIZE])
        }
    }

    fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
    }
}

impl fmt::Write for LogRing {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            self.push(b);
        }
        Ok(())
    }
}

/// Returns the current processor APIC ID so we can tag logs with the physical core.
#[cfg(target_arch = "x86_64")]
fn apic_id() -> u32 {
    x86::cpuid::cpuid!(0x1).ebx >> 24
}

#[cfg(not(target_arch = "x86_64"))]
fn apic_id() -> u32 {
    0
}

/// Convenience getter for the host driver that drains the ring.
pub fn global_logger() -> &'static RingLogger {
    &RING_LOGGER
}
