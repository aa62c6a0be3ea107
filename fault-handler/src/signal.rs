use crate::Error;
use std::{fmt, io, mem, ptr, str::FromStr};

/// The signals that we support catching and raising
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Signal {
    /// Segmentation fault
    Segv = libc::SIGSEGV,
    /// Arithmetic trap, eg. integer division by zero
    Fpe = libc::SIGFPE,
    /// Bus error
    Bus = libc::SIGBUS,
    /// Illegal instruction
    Illegal = libc::SIGILL,
}

/// The platform features that are available, resolved when the crate is built.
///
/// Every target this crate builds for has POSIX signals, and all of them
/// define and deliver both `SIGBUS` and `SIGILL`, so `bus` and `illegal` are
/// currently always true. They are kept so that callers can check for them
/// the same way as `alt_stack`, which does vary by target.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// `sigaltstack` is available, without it a stack overflow can't be reported
    pub alt_stack: bool,
    /// `SIGBUS` can be raised and caught, [`Signal::Bus`] is in
    /// [`Signal::SUPPORTED`]
    pub bus: bool,
    /// `SIGILL` can be raised and caught, [`Signal::Illegal`] is in
    /// [`Signal::SUPPORTED`]
    pub illegal: bool,
}

pub const CAPABILITIES: Capabilities = Capabilities {
    alt_stack: cfg!(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "illumos",
        target_os = "solaris",
    )),
    // Targets without POSIX signals fail to build, see lib.rs
    bus: true,
    illegal: true,
};

impl Signal {
    /// Every signal that can be handled on this platform, in the order the
    /// handlers are installed
    pub const SUPPORTED: &'static [Signal] = &[Self::Segv, Self::Fpe, Self::Bus, Self::Illegal];

    /// The number of [`Signal`] variants
    pub(crate) const COUNT: usize = 4;

    #[inline]
    pub fn from_raw(signo: i32) -> Option<Self> {
        Some(match signo {
            libc::SIGSEGV => Self::Segv,
            libc::SIGFPE => Self::Fpe,
            libc::SIGBUS => Self::Bus,
            libc::SIGILL => Self::Illegal,
            _ => return None,
        })
    }

    #[inline]
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// A dense index, used for the per-signal disposition slots
    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            Self::Segv => 0,
            Self::Fpe => 1,
            Self::Bus => 2,
            Self::Illegal => 3,
        }
    }

    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Self::Segv => "SIGSEGV",
            Self::Fpe => "SIGFPE",
            Self::Bus => "SIGBUS",
            Self::Illegal => "SIGILL",
        }
    }

    /// The human readable description used in the first line of a report
    #[inline]
    pub fn description(self) -> &'static str {
        match self {
            Self::Segv => "Segmentation fault",
            Self::Fpe => "Floating point exception",
            Self::Bus => "Bus error",
            Self::Illegal => "Illegal instruction",
        }
    }

    #[inline]
    pub fn flag(self) -> SignalSet {
        match self {
            Self::Segv => SignalSet::SEGV,
            Self::Fpe => SignalSet::FPE,
            Self::Bus => SignalSet::BUS,
            Self::Illegal => SignalSet::ILLEGAL,
        }
    }

    /// Retrieves the disposition currently registered with the OS for this
    /// signal
    pub fn disposition(self) -> io::Result<Disposition> {
        // SAFETY: syscall, querying only
        unsafe {
            let mut current: libc::sigaction = mem::zeroed();
            if libc::sigaction(self as i32, ptr::null(), &mut current) == -1 {
                return Err(io::Error::last_os_error());
            }

            Ok(Disposition::from_sigaction(&current))
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Signal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let lower = s.to_ascii_lowercase();
        let name = lower.strip_prefix("sig").unwrap_or(&lower);

        Ok(match name {
            "segv" | "segfault" => Self::Segv,
            "fpe" => Self::Fpe,
            "bus" => Self::Bus,
            "ill" | "illegal" => Self::Illegal,
            _ => return Err(Error::InvalidSignal(s.to_owned())),
        })
    }
}

bitflags::bitflags! {
    /// A set of [`Signal`]s
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct SignalSet: u8 {
        const SEGV = 1 << 0;
        const FPE = 1 << 1;
        const BUS = 1 << 2;
        const ILLEGAL = 1 << 3;
    }
}

impl SignalSet {
    /// Every signal in [`Signal::SUPPORTED`]
    pub fn supported() -> Self {
        Signal::SUPPORTED
            .iter()
            .fold(Self::empty(), |set, sig| set | sig.flag())
    }

    #[inline]
    pub fn contains_signal(self, signal: Signal) -> bool {
        self.contains(signal.flag())
    }

    /// The supported signals in this set
    pub fn signals(self) -> impl Iterator<Item = Signal> {
        Signal::SUPPORTED
            .iter()
            .copied()
            .filter(move |sig| self.contains_signal(*sig))
    }
}

impl Default for SignalSet {
    fn default() -> Self {
        Self::supported()
    }
}

impl From<Signal> for SignalSet {
    fn from(signal: Signal) -> Self {
        signal.flag()
    }
}

/// Parses a comma separated list of signal names, eg. `segv,fpe` or
/// `SIGSEGV, SIGBUS`. `all` selects every supported signal.
impl FromStr for SignalSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = Self::empty();

        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if name.eq_ignore_ascii_case("all") {
                set |= Self::supported();
            } else {
                set |= name.parse::<Signal>()?.flag();
            }
        }

        Ok(set)
    }
}

/// A comparable view of a `sigaction`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// `SIG_DFL`, the default action for the signal
    Default,
    /// `SIG_IGN`
    Ignore,
    /// A handler function
    Handler { address: usize, flags: i32 },
}

impl Disposition {
    #[inline]
    pub(crate) fn from_sigaction(sa: &libc::sigaction) -> Self {
        match sa.sa_sigaction {
            libc::SIG_DFL => Self::Default,
            libc::SIG_IGN => Self::Ignore,
            address => Self::Handler {
                address,
                flags: sa.sa_flags as i32,
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_signal_names() {
        assert_eq!("segv".parse::<Signal>().unwrap(), Signal::Segv);
        assert_eq!("SIGFPE".parse::<Signal>().unwrap(), Signal::Fpe);
        assert_eq!(" SigBus ".parse::<Signal>().unwrap(), Signal::Bus);
        assert_eq!("ill".parse::<Signal>().unwrap(), Signal::Illegal);
        assert!(matches!(
            "sigint".parse::<Signal>(),
            Err(Error::InvalidSignal(s)) if s == "sigint"
        ));
    }

    #[test]
    fn parses_signal_sets() {
        assert_eq!(
            "segv, fpe".parse::<SignalSet>().unwrap(),
            SignalSet::SEGV | SignalSet::FPE
        );
        assert_eq!("all".parse::<SignalSet>().unwrap(), SignalSet::supported());
        assert_eq!("".parse::<SignalSet>().unwrap(), SignalSet::empty());
        assert!("segv,term".parse::<SignalSet>().is_err());
    }

    #[test]
    fn raw_round_trips() {
        for sig in Signal::SUPPORTED {
            assert_eq!(Signal::from_raw(sig.as_raw()), Some(*sig));
        }

        assert_eq!(Signal::from_raw(libc::SIGINT), None);
    }

    #[test]
    fn capabilities_match_supported_signals() {
        let supported = SignalSet::supported();
        assert_eq!(CAPABILITIES.bus, supported.contains(SignalSet::BUS));
        assert_eq!(CAPABILITIES.illegal, supported.contains(SignalSet::ILLEGAL));
        assert_eq!(Signal::SUPPORTED.len(), Signal::COUNT);
    }

    #[test]
    fn indices_are_dense() {
        let mut seen = [false; Signal::COUNT];
        for sig in Signal::SUPPORTED {
            assert!(!seen[sig.index()]);
            seen[sig.index()] = true;
        }
    }

    #[test]
    fn set_iterates_in_install_order() {
        let set = SignalSet::ILLEGAL | SignalSet::SEGV;
        assert_eq!(
            set.signals().collect::<Vec<_>>(),
            vec![Signal::Segv, Signal::Illegal]
        );
    }
}
