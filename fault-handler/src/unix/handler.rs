use super::{registry, state::SHARED};
use crate::{FaultInfo, OutputSink, Report, Signal};
use std::{
    cell::Cell,
    mem, ptr,
    sync::atomic::Ordering,
};

/// How long a handler waits for reports from faults on other threads to be
/// written before it lets its own fault be delivered again, which will most
/// likely kill the process
const CONCURRENT_REPORT_WAIT_MS: u32 = 2000;

/// How long the handlers stay installed after a report, at minimum, so that a
/// fault on another thread that happens at nearly the same time is still
/// delivered to us rather than the previous disposition
const CONCURRENT_FAULT_GRACE_MS: u32 = 100;

thread_local! {
    /// Set while the handler is running on this thread
    static IN_HANDLER: Cell<bool> = const { Cell::new(false) };
}

/// This is the actual function installed for each signal we support, invoked
/// by the kernel
pub(super) unsafe extern "C" fn signal_handler(
    sig: i32,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    unsafe {
        // We might run inside a process where some other buggy code saves and
        // restores signal handlers temporarily with `signal` instead of `sigaction`.
        // This loses the `SA_SIGINFO` flag associated with this function. As a
        // consequence, the values of `info` and `uc` become totally bogus,
        // generally inducing a crash.
        //
        // The following code tries to detect this case. When it does, it
        // resets the signal handlers with `sigaction` & `SA_SIGINFO` and returns.
        // This forces the signal to be thrown again, but this time the kernel
        // will call the function with the right arguments.
        {
            let mut cur_handler: libc::sigaction = mem::zeroed();
            if libc::sigaction(sig, ptr::null(), &mut cur_handler) == 0
                && cur_handler.sa_sigaction == signal_handler as *const () as usize
                && cur_handler.sa_flags & libc::SA_SIGINFO == 0
            {
                let action = registry::handler_action();
                if libc::sigaction(sig, &action, ptr::null_mut()) == -1 {
                    // When resetting the handler fails, try to reset the
                    // default one to avoid an infinite loop here.
                    registry::install_default_handler(sig);
                }

                // exit the handler as we should be called again soon
                return;
            }
        }

        let Some(signal) = Signal::from_raw(sig) else {
            return;
        };
        let info = &*info;

        if IN_HANDLER.replace(true) {
            // We faulted while handling a fault on this same thread, which can
            // only be the report itself (eg. a bad appender), give up on the
            // report and let the original disposition deal with it
            crate::debug_print!("fault while reporting, restoring handlers");
            SHARED.registry.restore_all();
            return;
        }

        // Counted before anything else is read, the controller relies on this
        // to know when a retired appender can no longer be reached
        SHARED.in_flight.fetch_add(1, Ordering::SeqCst);

        // Another thread may have reported its own fault and restored the
        // handlers after this fault was delivered to us, this fault still gets
        // its report. Only a `disable` racing the fault skips it.
        let report =
            SHARED.enabled.load(Ordering::SeqCst) || SHARED.faulted.load(Ordering::SeqCst);

        if report {
            write_report(signal, info, uc);
        } else {
            crate::debug_print!("handler disabled, skipping report");
        }

        SHARED.in_flight.fetch_sub(1, Ordering::SeqCst);

        if report {
            wait_for_concurrent_reports();

            // Must be set before enabled is cleared, see above
            SHARED.faulted.store(true, Ordering::SeqCst);
            SHARED.enabled.store(false, Ordering::SeqCst);
        }

        // Upon returning from this signal handler, sig will become unmasked and
        // then it will be retriggered. Restore the previously installed
        // handlers first so that when the signal is retriggered it will be
        // delivered to the appropriate handler, or the default action is taken.
        crate::debug_print!("restoring handlers");
        SHARED.registry.restore_all();

        IN_HANDLER.set(false);

        crate::debug_print!("finishing signal handler");

        if info.si_code <= 0 {
            // This signal was triggered by somebody sending us the signal with
            // kill() or raise(). In order to retrigger it, we have to queue a new
            // signal ourselves.
            if !reraise(sig) {
                // If we failed to kill ourselves (e.g. because a sandbox disallows us
                // to do so), we instead resort to terminating our process. This will
                // result in an incorrect exit code.
                libc::_exit(1);
            }
        } else {
            // This was a synchronous signal triggered by a hard fault (e.g. SIGSEGV).
            // No need to reissue the signal. It will automatically trigger again,
            // when we return from the signal handler.
        }
    }
}

/// Writes the report for the fault, including whatever the appender adds
unsafe fn write_report(signal: Signal, info: &libc::siginfo_t, uc: *mut libc::c_void) {
    unsafe {
        let fault = fault_info(signal, info, uc);
        let sink = OutputSink::from_raw_fd(SHARED.output.load(Ordering::SeqCst));
        let mut report = Report::new(&sink);

        write_header(&fault, &mut report);
        // A failed write is ignored, there's nothing we can do about it and the
        // fault must still be delivered
        let _ = report.flush();

        if let Some(appender) = SHARED.appender.load(Ordering::SeqCst).as_ref() {
            crate::debug_print!("running report appender");
            appender.append(&fault, &mut report);
            let _ = report.flush();
        }
    }
}

/// Keeps the handlers installed for at least [`CONCURRENT_FAULT_GRACE_MS`], and
/// then until every other thread that entered the handler has left it, so that
/// concurrent faults all get their report out before we restore the handlers
/// and (probably) kill the process out from under them
fn wait_for_concurrent_reports() {
    // SAFETY: timespec is plain old data
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    ts.tv_nsec = 1_000_000;

    for waited in 0..CONCURRENT_REPORT_WAIT_MS {
        if waited >= CONCURRENT_FAULT_GRACE_MS && SHARED.in_flight.load(Ordering::SeqCst) == 0 {
            break;
        }

        // SAFETY: syscall
        unsafe {
            libc::nanosleep(&ts, ptr::null_mut());
        }
    }
}

fn write_header(fault: &FaultInfo, report: &mut Report<'_>) {
    report
        .push_str("Fatal error: ")
        .push_str(fault.signal.description())
        .newline()
        .push_str("  signal: ")
        .push_dec(fault.signal.as_raw() as u64)
        .push_str(" (")
        .push_str(fault.signal.name())
        .push_str("), code: ")
        .push_signed(fault.code.into())
        .newline();

    if fault.is_user_sent() {
        report.push_str("  sent by kill or raise").newline();
    } else if let Some(address) = fault.address {
        report.push_str("  fault address: ").push_hex(address).newline();
    }

    report
        .push_str("  process: ")
        .push_dec(fault.pid.into())
        .push_str(", thread: ")
        .push_dec(fault.tid)
        .newline();

    if let Some(ip) = fault.instruction_pointer {
        report.push_str("  instruction pointer: ").push_hex(ip).newline();
    }

    if let Some(sp) = fault.stack_pointer {
        report.push_str("  stack pointer: ").push_hex(sp).newline();
    }
}

unsafe fn fault_info(signal: Signal, info: &libc::siginfo_t, uc: *mut libc::c_void) -> FaultInfo {
    let (instruction_pointer, stack_pointer) = if uc.is_null() {
        (None, None)
    } else {
        // SAFETY: the kernel hands us a valid ucontext_t since we use SA_SIGINFO
        unsafe { registers(&*uc.cast::<libc::ucontext_t>()) }
    };

    FaultInfo {
        signal,
        code: info.si_code,
        // SAFETY: reading the union is fine, the value is meaningless for user
        // sent signals but that is indicated by the code
        address: unsafe { fault_address(info) },
        // SAFETY: syscall
        pid: unsafe { libc::getpid() } as u32,
        tid: current_tid(),
        instruction_pointer,
        stack_pointer,
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        #[inline]
        fn current_tid() -> u64 {
            // SAFETY: syscall
            unsafe { libc::syscall(libc::SYS_gettid) as u64 }
        }

        /// Queues the signal again for the current thread
        unsafe fn reraise(sig: i32) -> bool {
            unsafe {
                let tid = libc::syscall(libc::SYS_gettid) as i32;
                libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, sig) >= 0
            }
        }
    } else {
        #[inline]
        fn current_tid() -> u64 {
            // SAFETY: pthread_self can't fail
            unsafe { libc::pthread_self() as usize as u64 }
        }

        /// Queues the signal again for the current thread
        unsafe fn reraise(sig: i32) -> bool {
            unsafe { libc::raise(sig) == 0 }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        #[inline]
        unsafe fn fault_address(info: &libc::siginfo_t) -> Option<usize> {
            Some(unsafe { info.si_addr() } as usize)
        }
    } else if #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))] {
        #[inline]
        unsafe fn fault_address(info: &libc::siginfo_t) -> Option<usize> {
            Some(info.si_addr as usize)
        }
    } else {
        #[inline]
        unsafe fn fault_address(_info: &libc::siginfo_t) -> Option<usize> {
            None
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_env = "gnu", target_arch = "x86_64"))] {
        #[inline]
        fn registers(uc: &libc::ucontext_t) -> (Option<usize>, Option<usize>) {
            let mc = &uc.uc_mcontext;
            (
                Some(mc.gregs[libc::REG_RIP as usize] as usize),
                Some(mc.gregs[libc::REG_RSP as usize] as usize),
            )
        }
    } else if #[cfg(all(target_os = "linux", target_env = "gnu", target_arch = "aarch64"))] {
        #[inline]
        fn registers(uc: &libc::ucontext_t) -> (Option<usize>, Option<usize>) {
            (Some(uc.uc_mcontext.pc as usize), Some(uc.uc_mcontext.sp as usize))
        }
    } else {
        #[inline]
        fn registers(_uc: &libc::ucontext_t) -> (Option<usize>, Option<usize>) {
            (None, None)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fault(signal: Signal, code: i32) -> FaultInfo {
        FaultInfo {
            signal,
            code,
            address: Some(0x10),
            pid: 42,
            tid: 43,
            instruction_pointer: Some(0x1000),
            stack_pointer: None,
        }
    }

    fn header(fault: &FaultInfo) -> String {
        let sink = OutputSink::stderr();
        let mut report = Report::new(&sink);
        write_header(fault, &mut report);
        String::from_utf8(report.buffered().to_vec()).unwrap()
    }

    #[test]
    fn hardware_fault_header() {
        let header = header(&fault(Signal::Segv, 1));
        let mut lines = header.lines();

        assert_eq!(lines.next(), Some("Fatal error: Segmentation fault"));
        assert_eq!(
            lines.next().unwrap(),
            format!("  signal: {} (SIGSEGV), code: 1", libc::SIGSEGV)
        );
        assert!(lines.next().unwrap().starts_with("  fault address: 0x0"));
        assert_eq!(lines.next(), Some("  process: 42, thread: 43"));
        assert!(lines.next().unwrap().starts_with("  instruction pointer: 0x"));
        assert_eq!(lines.next(), None);
    }

    /// Delivers a fake hardware `SIGFPE` straight to the handler, nothing is
    /// installed so it just returns
    fn deliver_fpe() {
        unsafe {
            let mut info: libc::siginfo_t = mem::zeroed();
            info.si_signo = libc::SIGFPE;
            // FPE_INTDIV
            info.si_code = 1;
            signal_handler(libc::SIGFPE, &mut info, ptr::null_mut());
        }
    }

    #[test]
    fn reports_unless_disabled() {
        use std::{io::Read, os::unix::io::FromRawFd};

        let mut fds = [0; 2];
        unsafe {
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
        }
        SHARED.output.store(fds[1], Ordering::SeqCst);

        // disable() raced the fault
        SHARED.enabled.store(false, Ordering::SeqCst);
        SHARED.faulted.store(false, Ordering::SeqCst);
        deliver_fpe();
        assert!(!SHARED.faulted.load(Ordering::SeqCst));

        SHARED.enabled.store(true, Ordering::SeqCst);
        deliver_fpe();
        assert!(!SHARED.enabled.load(Ordering::SeqCst));
        assert!(SHARED.faulted.load(Ordering::SeqCst));

        // Another thread has already reported and restored the handlers, but
        // this fault was delivered to us so it is still reported
        deliver_fpe();

        assert_eq!(SHARED.in_flight.load(Ordering::SeqCst), 0);

        SHARED.faulted.store(false, Ordering::SeqCst);
        SHARED.output.store(libc::STDERR_FILENO, Ordering::SeqCst);

        let mut output = String::new();
        unsafe {
            libc::close(fds[1]);
            std::fs::File::from_raw_fd(fds[0])
                .read_to_string(&mut output)
                .unwrap();
        }

        assert_eq!(
            output
                .matches("Fatal error: Floating point exception\n")
                .count(),
            2
        );
        assert!(!output.contains("sent by kill or raise"));
    }

    #[test]
    fn user_sent_header() {
        let header = header(&fault(Signal::Fpe, 0));

        assert!(header.starts_with("Fatal error: Floating point exception\n"));
        assert!(header.contains("code: 0\n  sent by kill or raise\n"));
        assert!(!header.contains("fault address"));
    }
}
