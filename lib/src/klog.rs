//! Kernel logging subsystem.
//!
//! All kernel log output funnels through a single registered **sink**: a
//! function taking raw bytes. The board's serial (or ITM, or semihosting)
//! driver registers itself once during bring-up; until then log lines are
//! dropped, because this crate deliberately knows nothing about hardware.
//!
//! # Sink contract
//!
//! The sink receives the bytes of a single log line in one or more chunks
//! followed by a final `b"\n"` chunk, all from one `log_args` call. It is
//! responsible for any serialization against other writers and for newline
//! translation the transport needs.
//!
//! # Registration
//!
//! ```ignore
//! // In your serial driver init:
//! ternos_lib::klog::klog_register_sink(my_sink_fn);
//! ```

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

// ---------------------------------------------------------------------------
// Log levels
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KlogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl KlogLevel {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => KlogLevel::Error,
            1 => KlogLevel::Warn,
            2 => KlogLevel::Info,
            3 => KlogLevel::Debug,
            _ => KlogLevel::Trace,
        }
    }
}

static CURRENT_LEVEL: AtomicU8 = AtomicU8::new(KlogLevel::Info as u8);

#[inline(always)]
fn is_enabled(level: KlogLevel) -> bool {
    level as u8 <= CURRENT_LEVEL.load(Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Sink dispatch
// ---------------------------------------------------------------------------

/// Signature of a klog sink: a raw byte-chunk writer.
pub type KlogSink = fn(&[u8]);

/// Stored as a raw pointer; `null` means "no sink registered, drop output".
static SINK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

#[inline]
fn current_sink() -> Option<KlogSink> {
    let ptr = SINK.load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        // SAFETY: `klog_register_sink` only stores valid `KlogSink` fn
        // pointers, which have the same size as `*mut ()` on all supported
        // targets.
        Some(unsafe { core::mem::transmute::<*mut (), KlogSink>(ptr) })
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Register the raw byte sink. Typically called once by the board's console
/// driver during initialisation; a later call replaces the sink.
pub fn klog_register_sink(sink: KlogSink) {
    SINK.store(sink as *mut (), Ordering::Release);
}

/// Initialise klog (resets the level to the default).
pub fn klog_init() {
    CURRENT_LEVEL.store(KlogLevel::Info as u8, Ordering::Relaxed);
}

pub fn klog_set_level(level: KlogLevel) {
    CURRENT_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn klog_get_level() -> KlogLevel {
    KlogLevel::from_raw(CURRENT_LEVEL.load(Ordering::Relaxed))
}

pub fn klog_is_enabled(level: KlogLevel) -> bool {
    is_enabled(level)
}

/// Emit a formatted log line at the given level.
///
/// A trailing newline chunk is appended — callers should **not** include one
/// in their format string.
pub fn log_args(level: KlogLevel, args: fmt::Arguments<'_>) {
    if !is_enabled(level) {
        return;
    }
    let Some(sink) = current_sink() else {
        return;
    };

    struct SinkWriter(KlogSink);

    impl fmt::Write for SinkWriter {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            (self.0)(s.as_bytes());
            Ok(())
        }
    }

    let _ = fmt::write(&mut SinkWriter(sink), args);
    sink(b"\n");
}

// ---------------------------------------------------------------------------
// Macros
// ---------------------------------------------------------------------------

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::klog::log_args($level, ::core::format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! klog_error {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Error, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_warn {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Warn, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_info {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Info, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_debug {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Debug, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_trace {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Trace, ::core::format_args!($($arg)*))
    };
}
