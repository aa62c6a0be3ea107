use super::{
    altstack::{self, AlternateStack},
    registry::{DispositionRecord, Registry},
};
use crate::{Config, Error, ReportAppender, Signal, SignalSet};
use std::{
    io, mem, ptr,
    sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, Ordering},
};

/// The state the signal handler reads, published by the [`Controller`] before
/// any handler is installed. The handler never blocks on anything in here.
pub(super) struct Shared {
    pub(super) enabled: AtomicBool,
    /// Set by the first handler to report a fault, before it clears `enabled`,
    /// so that faults already delivered on other threads are still reported
    pub(super) faulted: AtomicBool,
    /// The file descriptor of the [`crate::OutputSink`]
    pub(super) output: AtomicI32,
    /// Points into the box kept alive by [`Lifecycle::appender`]
    pub(super) appender: AtomicPtr<Box<dyn ReportAppender>>,
    /// The number of threads currently running the signal handler
    pub(super) in_flight: AtomicU32,
    pub(super) registry: Registry,
}

pub(super) static SHARED: Shared = Shared {
    enabled: AtomicBool::new(false),
    faulted: AtomicBool::new(false),
    output: AtomicI32::new(libc::STDERR_FILENO),
    appender: AtomicPtr::new(ptr::null_mut()),
    in_flight: AtomicU32::new(0),
    registry: Registry::new(),
};

/// Everything that is only touched outside of signal context
struct Lifecycle {
    stack: Option<AlternateStack>,
    appender: Option<Box<Box<dyn ReportAppender>>>,
    release_lock: Option<fn()>,
}

/// The process wide owner of the fault handler.
///
/// There is exactly one, as signal dispositions are process wide, retrieved
/// via [`controller`].
pub struct Controller {
    inner: parking_lot::Mutex<Lifecycle>,
}

static CONTROLLER: Controller = Controller {
    inner: parking_lot::const_mutex(Lifecycle {
        stack: None,
        appender: None,
        release_lock: None,
    }),
};

/// Retrieves the process wide [`Controller`]
#[inline]
pub fn controller() -> &'static Controller {
    &CONTROLLER
}

impl Controller {
    /// Installs the fault handler for every signal in the configuration that
    /// is supported on this platform.
    ///
    /// If the handler is already enabled this is a no-op, the configuration is
    /// not applied.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Io`] if the output isn't an open, writable
    /// descriptor. If the handler can't be installed for one of the signals,
    /// the signals that were installed by this call are restored and the
    /// controller remains disabled. Failing to provision the alternate stack is
    /// only logged, as it only affects reporting of stack overflows.
    pub fn enable(&self, config: Config) -> Result<(), Error> {
        let mut lifecycle = self.inner.lock();

        if SHARED.enabled.load(Ordering::SeqCst) {
            log::debug!("fault handler is already enabled");
            return Ok(());
        }

        let Config {
            output,
            signals,
            alt_stack,
            release_lock,
            appender,
        } = config;

        output.validate()?;
        SHARED.output.store(output.raw_fd(), Ordering::SeqCst);

        let appender = appender.map(Box::new);
        let appender_ptr = appender
            .as_deref()
            .map_or(ptr::null_mut(), |a| ptr::from_ref(a).cast_mut());
        SHARED.appender.store(appender_ptr, Ordering::SeqCst);
        if let Some(previous) = mem::replace(&mut lifecycle.appender, appender) {
            retire_appender(previous, &SHARED.in_flight);
        }
        lifecycle.release_lock = release_lock;

        if alt_stack && lifecycle.stack.is_none() {
            match altstack::provision() {
                Ok(stack) => {
                    log::debug!(
                        "alternate stack of {} bytes at {:p}",
                        stack.size(),
                        stack.base()
                    );
                    lifecycle.stack = Some(stack);
                }
                Err(err) => {
                    log::warn!("stack overflows will not be reported: {err}");
                }
            }
        }

        // This must be set before the first handler is installed, otherwise a
        // fault in between would be passed on without a report
        SHARED.faulted.store(false, Ordering::SeqCst);
        SHARED.enabled.store(true, Ordering::SeqCst);

        let installed = install_signals(
            signals,
            // SAFETY: syscalls, we hold the lock
            |signal| unsafe { SHARED.registry.install(signal) }.map(|_record| ()),
            |signal| {
                SHARED.registry.restore(signal);
            },
        );

        match installed {
            Ok(installed) => {
                log::info!("fault handler enabled for {installed:?}");
                Ok(())
            }
            Err(err) => {
                SHARED.enabled.store(false, Ordering::SeqCst);
                SHARED.appender.store(ptr::null_mut(), Ordering::SeqCst);

                log::error!("failed to enable fault handler: {err}");
                Err(err)
            }
        }
    }

    /// Restores the dispositions that every handled signal had before
    /// [`Self::enable`].
    ///
    /// If the handler is not enabled this is a no-op. The alternate stack is
    /// kept, see [`Self::release_alt_stack`].
    pub fn disable(&self) -> Result<(), Error> {
        let _lifecycle = self.inner.lock();

        let was_enabled = SHARED.enabled.swap(false, Ordering::SeqCst);
        let restored = SHARED.registry.restore_all();
        // The appender itself is kept alive until the next enable, a handler
        // that raced us may still be running it
        SHARED.appender.store(ptr::null_mut(), Ordering::SeqCst);

        if was_enabled {
            log::info!("fault handler disabled, restored {restored} signal(s)");
        } else {
            log::debug!("fault handler is not enabled");
        }

        Ok(())
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        SHARED.enabled.load(Ordering::SeqCst)
    }

    /// Enables the handler, disabling it again when the returned guard is
    /// dropped.
    pub fn enable_scoped(&'static self, config: Config) -> Result<EnabledGuard, Error> {
        self.enable(config)?;
        Ok(EnabledGuard { controller: self })
    }

    /// Provisions the alternate stack for the calling thread now, rather than
    /// as part of [`Self::enable`], so that failures can be acted on.
    ///
    /// Does nothing if a stack is already provisioned.
    pub fn provision_alt_stack(&self) -> Result<(), Error> {
        let mut lifecycle = self.inner.lock();

        if lifecycle.stack.is_none() {
            let stack = altstack::provision()?;
            log::debug!(
                "alternate stack of {} bytes at {:p}",
                stack.size(),
                stack.base()
            );
            lifecycle.stack = Some(stack);
        }

        Ok(())
    }

    /// Unregisters and unmaps the alternate stack.
    ///
    /// The stack is deliberately kept for the lifetime of the process by
    /// [`Self::disable`], as a fault on another thread could still be running
    /// the handler on it. This can only be done while disabled, and only on the
    /// thread that enabled the handler, otherwise `false` is returned and the
    /// stack is kept.
    pub fn release_alt_stack(&self) -> bool {
        let mut lifecycle = self.inner.lock();

        if SHARED.enabled.load(Ordering::SeqCst) {
            log::warn!("refusing to release the alternate stack while enabled");
            return false;
        }

        let Some(stack) = &mut lifecycle.stack else {
            return true;
        };

        // SAFETY: no handler is installed
        if unsafe { stack.release() } {
            lifecycle.stack = None;
            true
        } else {
            log::warn!("alternate stack is not registered on the calling thread");
            false
        }
    }

    /// Whether an alternate stack is currently provisioned
    #[inline]
    pub fn has_alt_stack(&self) -> bool {
        self.inner
            .lock()
            .stack
            .as_ref()
            .is_some_and(|stack| stack.is_registered())
    }

    /// Calls the hook set by [`Config::release_lock_with`], if any, to release
    /// a lock held by the host before a fault is deliberately triggered
    pub fn release_host_lock(&self) {
        // Don't hold our lock while calling user code
        let release = self.inner.lock().release_lock;

        if let Some(release) = release {
            release();
        }
    }

    /// Retrieves the state of a signal
    #[inline]
    pub fn record(&self, signal: Signal) -> DispositionRecord {
        let _lifecycle = self.inner.lock();
        SHARED.registry.record(signal)
    }

    /// The number of threads currently running the signal handler, ie.
    /// reporting a fault or waiting for other threads to finish theirs
    #[inline]
    pub fn active_reports(&self) -> u32 {
        SHARED.in_flight.load(Ordering::SeqCst)
    }
}

/// Disables the fault handler when dropped, see [`Controller::enable_scoped`]
pub struct EnabledGuard {
    controller: &'static Controller,
}

impl Drop for EnabledGuard {
    fn drop(&mut self) {
        let _ = self.controller.disable();
    }
}

/// Installs the handler for every signal in the set, restoring the ones this
/// call already installed if any of them fails
fn install_signals(
    signals: SignalSet,
    mut install: impl FnMut(Signal) -> io::Result<()>,
    mut restore: impl FnMut(Signal),
) -> Result<SignalSet, Error> {
    let mut installed = SignalSet::empty();

    for signal in signals.signals() {
        if let Err(source) = install(signal) {
            for installed in installed.signals() {
                restore(installed);
            }

            return Err(Error::Install { signal, source });
        }

        installed |= signal.flag();
    }

    Ok(installed)
}

/// Drops an appender that is no longer published in [`Shared::appender`].
///
/// A handler that is already running may have loaded the pointer before it was
/// replaced, in that case the appender is leaked instead.
fn retire_appender(appender: Box<Box<dyn ReportAppender>>, in_flight: &AtomicU32) {
    if in_flight.load(Ordering::SeqCst) == 0 {
        drop(appender);
    } else {
        log::warn!("leaking the previous report appender, a fault is being reported");
        mem::forget(appender);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{FaultInfo, Report};
    use std::sync::{Arc, atomic::AtomicUsize};

    #[test]
    fn rolls_back_on_install_failure() {
        let mut installed = Vec::new();
        let mut restored = Vec::new();

        let err = install_signals(
            SignalSet::SEGV | SignalSet::FPE | SignalSet::BUS,
            |signal| {
                if signal == Signal::Bus {
                    return Err(io::Error::from_raw_os_error(libc::EINVAL));
                }

                installed.push(signal);
                Ok(())
            },
            |signal| restored.push(signal),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            Error::Install { signal: Signal::Bus, ref source } if source.raw_os_error() == Some(libc::EINVAL)
        ));
        assert_eq!(installed, [Signal::Segv, Signal::Fpe]);
        assert_eq!(restored, installed);
    }

    #[test]
    fn installs_every_signal() {
        let mut restored = 0;

        let installed = install_signals(
            SignalSet::supported(),
            |_signal| Ok(()),
            |_signal| restored += 1,
        )
        .unwrap();

        assert_eq!(installed, SignalSet::supported());
        assert_eq!(restored, 0);
    }

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    unsafe impl ReportAppender for Counted {
        fn append(&self, _fault: &FaultInfo, _report: &mut Report<'_>) {}
    }

    #[test]
    fn keeps_appender_alive_while_reporting() {
        let drops = Arc::new(AtomicUsize::new(0));
        let in_flight = AtomicU32::new(1);

        retire_appender(Box::new(Box::new(Counted(drops.clone()))), &in_flight);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        in_flight.store(0, Ordering::SeqCst);
        retire_appender(Box::new(Box::new(Counted(drops.clone()))), &in_flight);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
