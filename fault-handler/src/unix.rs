//! POSIX signal handling.
//!
//! The handler itself only touches the atomics in [`state::SHARED`], everything
//! else is owned by the [`Controller`] and only ever touched outside of signal
//! context, under its lock.

mod altstack;
mod handler;
mod registry;
mod state;

pub use registry::DispositionRecord;
pub use state::{Controller, EnabledGuard, controller};
