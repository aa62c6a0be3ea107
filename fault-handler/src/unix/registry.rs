use super::handler::signal_handler;
use crate::{Disposition, Signal};
use std::{
    cell::UnsafeCell,
    io,
    mem::{self, MaybeUninit},
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

/// A snapshot of the state of a single signal in the [`Registry`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DispositionRecord {
    pub signal: Signal,
    /// Whether our handler is the active handler for the signal
    pub installed: bool,
    /// What was registered before our handler was installed, only available
    /// while `installed` is true
    pub previous: Option<Disposition>,
}

struct Slot {
    installed: AtomicBool,
    /// Only written while `installed` is false, by the controller. Only read
    /// by whoever flips `installed` from true to false.
    previous: UnsafeCell<MaybeUninit<libc::sigaction>>,
}

unsafe impl Sync for Slot {}

impl Slot {
    const fn new() -> Self {
        Self {
            installed: AtomicBool::new(false),
            previous: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Keeps track of the disposition each signal had before our handler was
/// installed, so that it can be restored exactly
pub(super) struct Registry {
    slots: [Slot; Signal::COUNT],
}

impl Registry {
    pub(super) const fn new() -> Self {
        Self {
            slots: [const { Slot::new() }; Signal::COUNT],
        }
    }

    /// Installs our handler for the signal, saving the previous disposition.
    ///
    /// Installing a signal that is already installed is a no-op.
    ///
    /// # Safety
    ///
    /// Must not be called concurrently with itself for the same signal, which
    /// the controller's lock ensures.
    pub(super) unsafe fn install(&self, signal: Signal) -> io::Result<DispositionRecord> {
        let slot = &self.slots[signal.index()];

        if !slot.installed.load(Ordering::Acquire) {
            unsafe {
                let mut previous: libc::sigaction = mem::zeroed();
                if libc::sigaction(signal as i32, ptr::null(), &mut previous) == -1 {
                    return Err(io::Error::last_os_error());
                }

                (*slot.previous.get()).write(previous);

                // Mark the slot before swapping in our handler, if the signal is
                // delivered between the two the handler must be able to restore
                // the previous disposition rather than find nothing to restore
                // and loop forever
                slot.installed.store(true, Ordering::Release);

                let action = handler_action();
                if libc::sigaction(signal as i32, &action, ptr::null_mut()) == -1 {
                    let err = io::Error::last_os_error();
                    slot.installed.store(false, Ordering::Release);
                    return Err(err);
                }
            }
        }

        Ok(self.record(signal))
    }

    /// Restores the disposition the signal had before [`Self::install`].
    ///
    /// Returns false if our handler was not installed. This is async signal
    /// safe, and is called from the signal handler itself.
    pub(super) fn restore(&self, signal: Signal) -> bool {
        let slot = &self.slots[signal.index()];

        if !slot.installed.swap(false, Ordering::AcqRel) {
            return false;
        }

        // SAFETY: we won the swap above, so the previous action was written and
        // nothing else will read or write it until the slot is installed again
        unsafe {
            let previous = (*slot.previous.get()).assume_init_ref();
            if libc::sigaction(signal as i32, previous, ptr::null_mut()) == -1 {
                install_default_handler(signal as i32);
            }
        }

        true
    }

    /// Restores every installed signal, returning the number that were restored
    pub(super) fn restore_all(&self) -> usize {
        Signal::SUPPORTED
            .iter()
            .filter(|sig| self.restore(**sig))
            .count()
    }

    pub(super) fn record(&self, signal: Signal) -> DispositionRecord {
        let slot = &self.slots[signal.index()];
        let installed = slot.installed.load(Ordering::Acquire);

        DispositionRecord {
            signal,
            installed,
            previous: installed.then(|| {
                // SAFETY: the slot is installed, so the previous action is initialized
                unsafe { Disposition::from_sigaction((*slot.previous.get()).assume_init_ref()) }
            }),
        }
    }
}

/// The action installed for every signal we handle
pub(super) unsafe fn handler_action() -> libc::sigaction {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);

        // Mask all fault signals when we're handling one of them, a fault while
        // writing the report is then fatal rather than recursive
        for sig in Signal::SUPPORTED {
            libc::sigaddset(&mut sa.sa_mask, *sig as i32);
        }

        sa.sa_sigaction = signal_handler as *const () as usize;
        sa.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;
        sa
    }
}

/// Restores the signal handler for the specified signal back to its default
/// handler, which _should_ perform the default signal action as seen in
/// <https://man7.org/linux/man-pages/man7/signal.7.html>
#[inline]
pub(super) unsafe fn install_default_handler(sig: i32) {
    // Android L+ expose signal and sigaction symbols that override the system
    // ones. There is a bug in these functions where a request to set the handler
    // to SIG_DFL is ignored. In that case, an infinite loop is entered as the
    // signal is repeatedly sent to our signal handler.
    // To work around this, directly call the system's sigaction.
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "android")] {
                let mut sa: libc::sigaction = mem::zeroed();
                libc::sigemptyset(&mut sa.sa_mask);
                sa.sa_sigaction = libc::SIG_DFL;
                sa.sa_flags = libc::SA_RESTART;
                libc::syscall(
                    libc::SYS_rt_sigaction,
                    sig,
                    &sa,
                    ptr::null::<libc::sigaction>(),
                    mem::size_of::<libc::sigset_t>(),
                );
            } else {
                libc::signal(sig, libc::SIG_DFL);
            }
        }
    }
}
