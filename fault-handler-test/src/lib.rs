use fault_handler::Signal;
use std::{fmt, process::ExitStatus};

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    Bus,
    Fpe,
    /// `SIGFPE` sent with `raise` rather than by dividing by zero
    FpeRaised,
    Illegal,
    Segv,
    StackOverflow,
}

impl Fault {
    #[inline]
    pub fn signal(self) -> Signal {
        match self {
            Self::Bus => Signal::Bus,
            Self::Fpe | Self::FpeRaised => Signal::Fpe,
            Self::Illegal => Signal::Illegal,
            Self::Segv | Self::StackOverflow => Signal::Segv,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bus => "bus",
            Self::Fpe => "fpe",
            Self::FpeRaised => "fpe-raised",
            Self::Illegal => "illegal",
            Self::Segv => "segv",
            Self::StackOverflow => "stack-overflow",
        })
    }
}

/// The outcome of a crash-client run
pub struct Run {
    pub status: ExitStatus,
    pub pid: u32,
    pub stdout: String,
    pub stderr: String,
}

impl Run {
    /// The signal that killed the client, if it was killed by one
    #[inline]
    pub fn signal(&self) -> Option<i32> {
        use std::os::unix::process::ExitStatusExt;
        self.status.signal()
    }

    /// The number of reports written to stderr
    #[inline]
    pub fn reports(&self) -> usize {
        self.stderr.matches("Fatal error: ").count()
    }

    /// Asserts the client was killed by the signal the fault raises, ie. that
    /// the fault handler passed the signal on
    pub fn assert_killed_by(&self, fault: Fault) {
        let signal = self.signal();

        if fault == Fault::StackOverflow {
            // Rust's own handler for stack overflows is the previous disposition,
            // it prints a message and aborts
            assert!(
                matches!(signal, Some(libc::SIGSEGV | libc::SIGABRT)),
                "unexpected exit {}",
                self.status
            );
        } else {
            assert_eq!(
                signal,
                Some(fault.signal().as_raw()),
                "unexpected exit {}",
                self.status
            );
        }
    }
}

pub fn run_client(fault: Fault, args: &[&str]) -> Run {
    use std::env;

    // Adapted from
    // https://github.com/rust-lang/cargo/blob/485670b3983b52289a2f353d589c57fae2f60f82/tests/testsuite/support/mod.rs#L507
    let mut cmd_path = env::current_exe().expect("failed to get exe path");
    cmd_path.pop();
    if cmd_path.ends_with("deps") {
        cmd_path.pop();
    }

    cmd_path.push("crash-client");
    if !env::consts::EXE_SUFFIX.is_empty() {
        cmd_path.set_extension(env::consts::EXE_SUFFIX);
    }

    let mut cmd = std::process::Command::new(&cmd_path);
    cmd.stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    cmd.args(["--fault", &fault.to_string()]);
    cmd.args(args);

    let child = cmd.spawn().expect("failed to run crash-client");
    let pid = child.id();
    let output = child.wait_with_output().expect("failed to wait for output");

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    println!("{stdout}");
    eprintln!("{stderr}");

    // The client exits with this if it failed to set up or survived the fault
    assert_ne!(output.status.code(), Some(222), "crash-client failed");

    Run {
        status: output.status,
        pid,
        stdout,
        stderr,
    }
}

/// Asserts that `output` contains a single well formed report for the fault,
/// written by the process `pid`
pub fn assert_report(output: &str, fault: Fault, pid: u32) {
    let signal = fault.signal();

    let start = output
        .find("Fatal error: ")
        .expect("failed to find report");
    assert_eq!(
        output.matches("Fatal error: ").count(),
        1,
        "expected exactly one report"
    );

    let mut lines = output[start..].lines();

    assert_eq!(
        lines.next().unwrap(),
        format!("Fatal error: {}", signal.description())
    );

    let signal_line = lines.next().unwrap();
    let code: i32 = signal_line
        .strip_prefix(&format!("  signal: {} ({}), code: ", signal.as_raw(), signal.name()))
        .unwrap_or_else(|| panic!("unexpected signal line '{signal_line}'"))
        .parse()
        .expect("invalid signal code");

    let mut line = lines.next().unwrap();
    if fault == Fault::FpeRaised {
        assert!(code <= 0);
        assert_eq!(line, "  sent by kill or raise");
        line = lines.next().unwrap();
    } else {
        assert!(code > 0, "hardware faults have a positive code");

        if let Some(address) = line.strip_prefix("  fault address: 0x") {
            let address = usize::from_str_radix(address, 16).expect("invalid fault address");
            if fault == Fault::Segv {
                assert_eq!(address, sadness_generator::SEGFAULT_ADDRESS);
            }

            line = lines.next().unwrap();
        } else {
            assert!(
                !cfg!(any(target_os = "linux", target_os = "android")),
                "missing fault address"
            );
        }
    }

    let thread = line
        .strip_prefix(&format!("  process: {pid}, thread: "))
        .unwrap_or_else(|| panic!("unexpected process line '{line}'"));
    assert!(thread.parse::<u64>().is_ok(), "invalid thread id '{thread}'");

    cfg_if::cfg_if! {
        if #[cfg(all(target_os = "linux", target_env = "gnu", any(target_arch = "x86_64", target_arch = "aarch64")))] {
            assert!(lines.next().unwrap().starts_with("  instruction pointer: 0x"));
            assert!(lines.next().unwrap().starts_with("  stack pointer: 0x"));
        }
    }
}

/// Runs the client for the fault, asserting it wrote a report then died from
/// the fault
pub fn run_test(fault: Fault, use_thread: bool) -> Run {
    let run = run_client(fault, if use_thread { &["--use-thread"] } else { &[] });

    run.assert_killed_by(fault);
    assert_report(&run.stderr, fault, run.pid);
    run
}

pub fn run_threaded_test(fault: Fault, count: u32) {
    use rayon::prelude::*;

    (0..count).into_par_iter().for_each(|_| {
        run_test(fault, true);
    });
}
