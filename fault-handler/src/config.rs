use crate::{Error, OutputSink, ReportAppender, SignalSet};

/// The environment variable that enables the fault handler at startup via
/// [`crate::enable_from_env`]
pub const ENABLE_VAR: &str = "RUST_FAULT_HANDLER";
/// The environment variable that narrows the set of handled signals, eg.
/// `segv,fpe`
pub const SIGNALS_VAR: &str = "RUST_FAULT_HANDLER_SIGNALS";

/// How the fault handler is configured when it is enabled
pub struct Config {
    pub(crate) output: OutputSink,
    pub(crate) signals: SignalSet,
    pub(crate) alt_stack: bool,
    pub(crate) release_lock: Option<fn()>,
    pub(crate) appender: Option<Box<dyn ReportAppender>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output: OutputSink::stderr(),
            signals: SignalSet::supported(),
            alt_stack: true,
            release_lock: None,
            appender: None,
        }
    }
}

impl Config {
    /// Where reports are written, stderr by default
    #[inline]
    pub fn output(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    /// The signals to handle, every supported signal by default. Signals that
    /// aren't supported on this platform are ignored.
    #[inline]
    pub fn signals(mut self, signals: impl Into<SignalSet>) -> Self {
        self.signals = signals.into();
        self
    }

    /// Whether an alternate signal stack is provisioned for the thread that
    /// enables the handler, on by default. Without it a stack overflow on that
    /// thread can't be reported.
    #[inline]
    pub fn alt_stack(mut self, alt_stack: bool) -> Self {
        self.alt_stack = alt_stack;
        self
    }

    /// A function that releases a coarse lock held by the host, eg. an
    /// interpreter lock, called by [`crate::trigger_segfault`] before it
    /// faults when asked to
    #[inline]
    pub fn release_lock_with(mut self, release: fn()) -> Self {
        self.release_lock = Some(release);
        self
    }

    /// Code that appends to every report, see [`ReportAppender`]
    #[inline]
    pub fn appender(mut self, appender: Box<dyn ReportAppender>) -> Self {
        self.appender = Some(appender);
        self
    }

    /// Builds the configuration from [`ENABLE_VAR`] and [`SIGNALS_VAR`].
    ///
    /// Returns `None` if the handler should not be enabled, ie. the enable
    /// variable is unset, empty, or `0`.
    pub fn from_env() -> Result<Option<Self>, Error> {
        let enable = std::env::var(ENABLE_VAR).ok();
        let signals = std::env::var(SIGNALS_VAR).ok();

        Self::from_values(enable.as_deref(), signals.as_deref())
    }

    fn from_values(enable: Option<&str>, signals: Option<&str>) -> Result<Option<Self>, Error> {
        match enable.map(str::trim) {
            None | Some("" | "0") => return Ok(None),
            Some(_) => {}
        }

        let mut config = Self::default();

        if let Some(signals) = signals.filter(|s| !s.trim().is_empty()) {
            config.signals = signals.parse()?;
        }

        Ok(Some(config))
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("output", &self.output)
            .field("signals", &self.signals)
            .field("alt_stack", &self.alt_stack)
            .field("release_lock", &self.release_lock.is_some())
            .field("appender", &self.appender.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn disabled_unless_asked() {
        assert!(Config::from_values(None, None).unwrap().is_none());
        assert!(Config::from_values(Some(""), Some("segv")).unwrap().is_none());
        assert!(Config::from_values(Some(" 0 "), None).unwrap().is_none());
    }

    #[test]
    fn enabled_with_all_signals() {
        let config = Config::from_values(Some("1"), None).unwrap().unwrap();
        assert_eq!(config.signals, SignalSet::supported());
        assert_eq!(config.output, OutputSink::stderr());
        assert!(config.alt_stack);
    }

    #[test]
    fn narrows_signals() {
        let config = Config::from_values(Some("yes"), Some("SIGSEGV,fpe"))
            .unwrap()
            .unwrap();
        assert_eq!(config.signals, SignalSet::SEGV | SignalSet::FPE);

        assert!(matches!(
            Config::from_values(Some("1"), Some("segv,hup")),
            Err(Error::InvalidSignal(_))
        ));
    }
}
