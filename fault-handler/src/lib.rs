//! `fault-handler` prints a diagnostic report when the process receives a
//! fatal signal, then lets the signal take its normal course so exit codes and
//! core dumps are exactly what they would have been without it.
//!
//! The following signals are handled
//!
//! ## `SIGSEGV`
//!
//! Signal sent to a process when it makes an invalid virtual memory reference,
//! a [segmentation fault](https://en.wikipedia.org/wiki/Segmentation_fault).
//! This covers infamous `null` pointer access, out of bounds access, use after
//! free, stack overflows, etc.
//!
//! ## `SIGFPE`
//!
//! Signal sent to a process when it executes an erroneous arithmetic operation.
//! Though it stands for **f**loating **p**oint **e**xception this signal covers
//! integer operations as well.
//!
//! ## `SIGBUS`
//!
//! Signal sent to a process when it causes a [bus error](https://en.wikipedia.org/wiki/Bus_error).
//!
//! ## `SIGILL`
//!
//! Signal sent to a process when it attempts to execute an **illegal**, malformed,
//! unknown, or privileged, instruction.
//!
//! # Single shot
//!
//! When one of the signals arrives the handler writes a short report to the
//! configured [`OutputSink`], restores whatever dispositions were in place
//! before [`enable`] was called, and returns. A hardware fault then simply
//! happens again under the original disposition; a signal sent with `kill` or
//! `raise` is queued again. Either way the process dies (or the previously
//! installed handler runs) exactly as if this crate was never involved, and a
//! second fault is not intercepted until [`enable`] is called again.
//!
//! # Alternate stack
//!
//! A `SIGSEGV` caused by a stack overflow can't be handled on the stack that
//! overflowed, so [`enable`] registers an [alternate signal stack](https://man7.org/linux/man-pages/man2/sigaltstack.2.html)
//! for the calling thread, unless one large enough is already registered.
//! Threads spawned by [`std::thread`] get their own from the Rust runtime.
//!
//! ```no_run
//! fault_handler::enable().expect("failed to enable fault handler");
//!
//! // Writes a report to stderr, then dies with SIGSEGV
//! fault_handler::trigger_segfault(false);
//! ```

#![allow(unsafe_code)]

mod config;
mod error;
mod signal;
mod sink;
mod trigger;

pub use config::{Config, ENABLE_VAR, SIGNALS_VAR};
pub use error::{Error, ProvisionError};
pub use signal::{CAPABILITIES, Capabilities, Disposition, Signal, SignalSet};
pub use sink::{OutputSink, Report};
pub use trigger::*;

/// Compatibility version of the report format and public surface.
pub const VERSION: u32 = 1;

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
pub fn write_stderr(s: &'static str) {
    let _ = OutputSink::stderr().write_all(s.as_bytes());
}

/// What the signal handler knows about a fault by the time it writes the
/// report.
#[derive(Copy, Clone, Debug)]
pub struct FaultInfo {
    /// The signal that was received
    pub signal: Signal,
    /// `si_code`, a value `<= 0` means the signal was sent by `kill`, `raise`
    /// or similar rather than generated by the hardware
    pub code: i32,
    /// The memory location that caused the fault, if the platform reports it
    pub address: Option<usize>,
    pub pid: u32,
    /// The kernel thread id on Linux/Android, `pthread_self` elsewhere
    pub tid: u64,
    /// The instruction pointer at the time of the fault
    pub instruction_pointer: Option<usize>,
    /// The stack pointer at the time of the fault
    pub stack_pointer: Option<usize>,
}

impl FaultInfo {
    /// True if the signal was sent from userspace rather than being raised by
    /// a hardware fault
    #[inline]
    pub fn is_user_sent(&self) -> bool {
        self.code <= 0
    }
}

/// User implemented trait for appending to the report of a fault, eg. with a
/// symbolicated call stack.
///
/// # Safety
///
/// This trait is marked unsafe as [`Self::append`] is run inside a signal
/// handler, in a compromised context. Only a small subset of libc functions
/// are [async signal safe](https://man7.org/linux/man-pages/man7/signal-safety.7.html)
/// and calling non-safe ones, including such common ones as `malloc`, can
/// deadlock or crash. Anything expensive should be prepared before
/// [`enable`] is called.
pub unsafe trait ReportAppender: Send + Sync {
    /// Appends text after the report header. The [`Report`] is flushed by the
    /// caller afterwards.
    fn append(&self, fault: &FaultInfo, report: &mut Report<'_>);
}

/// Creates a [`ReportAppender`] using the supplied closure as the implementation.
///
/// # Safety
///
/// See the [`ReportAppender`] Safety section for information on why this is `unsafe`.
#[inline]
pub unsafe fn make_report_appender<F>(closure: F) -> Box<dyn ReportAppender>
where
    F: Send + Sync + Fn(&FaultInfo, &mut Report<'_>) + 'static,
{
    struct Wrapper<F> {
        inner: F,
    }

    unsafe impl<F> ReportAppender for Wrapper<F>
    where
        F: Send + Sync + Fn(&FaultInfo, &mut Report<'_>),
    {
        fn append(&self, fault: &FaultInfo, report: &mut Report<'_>) {
            (self.inner)(fault, report);
        }
    }

    Box::new(Wrapper { inner: closure })
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;

        pub use unix::{Controller, DispositionRecord, EnabledGuard, controller};
    } else {
        compile_error!("fault-handler only supports targets with POSIX signals");
    }
}

/// Enables the fault handler for every supported signal, writing reports to
/// stderr.
///
/// Calling this while already enabled is a no-op.
#[inline]
pub fn enable() -> Result<(), Error> {
    controller().enable(Config::default())
}

/// Enables the fault handler with the specified configuration.
///
/// Calling this while already enabled is a no-op, the configuration is not
/// applied.
#[inline]
pub fn enable_with(config: Config) -> Result<(), Error> {
    controller().enable(config)
}

/// Enables the fault handler if `RUST_FAULT_HANDLER` asks for it, see
/// [`Config::from_env`]. Returns whether the handler was enabled.
pub fn enable_from_env() -> Result<bool, Error> {
    match Config::from_env()? {
        Some(config) => controller().enable(config).map(|()| true),
        None => Ok(false),
    }
}

/// Disables the fault handler, restoring the signal dispositions that were in
/// place when it was enabled.
///
/// Calling this while not enabled is a no-op.
#[inline]
pub fn disable() -> Result<(), Error> {
    controller().disable()
}

/// Whether the fault handler is currently enabled
#[inline]
pub fn is_enabled() -> bool {
    controller().is_enabled()
}
