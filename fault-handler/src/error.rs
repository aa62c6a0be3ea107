use crate::Signal;

/// An error that can occur when provisioning the alternate signal stack.
///
/// None of these prevent the handler from being installed, they only mean that
/// a stack overflow can't be reported.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The target has no `sigaltstack`
    #[error("alternate signal stacks are not supported on this platform")]
    PlatformUnsupported,
    /// Unable to `mmap` memory for the stack
    #[error("unable to allocate memory for the alternate signal stack")]
    OutOfMemory,
    /// `mprotect` or `sigaltstack` failed
    #[error("unable to register the alternate signal stack")]
    Register(#[source] std::io::Error),
}

/// An error that can occur when enabling or disabling the fault handler
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The OS refused to install the handler for a signal. Any signals that had
    /// already been installed by the same call are rolled back.
    #[error("unable to install handler for {signal}")]
    Install {
        signal: Signal,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    /// A signal name in the configuration was not recognized
    #[error("unknown signal '{0}'")]
    InvalidSignal(String),
    /// An I/O or other syscall failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
