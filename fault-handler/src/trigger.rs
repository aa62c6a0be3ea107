//! Functions that deliberately crash the process, to check that the fault
//! handler is working, eg. from an integration test or a debug command.
//!
//! None of these return if the fault handler (or something else) doesn't
//! intervene by exiting the process.

use crate::{CAPABILITIES, controller};

/// Raises `SIGSEGV` by reading an invalid address.
///
/// If `release_lock` is true the hook set by
/// [`crate::Config::release_lock_with`] is called first, so that the fault
/// handler doesn't deadlock on a lock held by the faulting thread.
pub fn trigger_segfault(release_lock: bool) {
    if release_lock {
        controller().release_host_lock();
    }

    sadness_generator::raise_segfault();
}

/// Raises `SIGFPE`
pub fn trigger_fpe() {
    sadness_generator::raise_floating_point_exception();
}

/// Raises `SIGBUS`, only available if [`CAPABILITIES`] says the platform
/// supports it
pub fn trigger_bus() {
    if CAPABILITIES.bus {
        sadness_generator::raise_bus();
    }
}

/// Raises `SIGILL`, only available if [`CAPABILITIES`] says the platform
/// supports it
pub fn trigger_illegal_instruction() {
    if CAPABILITIES.illegal {
        sadness_generator::raise_illegal_instruction();
    }
}

/// Raises `SIGSEGV` by overflowing the stack of the calling thread, this can
/// only be reported if the thread has an alternate stack.
pub fn trigger_stack_overflow() {
    sadness_generator::raise_stack_overflow();
}
