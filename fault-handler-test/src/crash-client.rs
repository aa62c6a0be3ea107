use fault_handler::{Config, FaultInfo, OutputSink, Report, Signal};
use fault_handler_test::Fault;

use clap::Parser;
use std::{
    path::PathBuf,
    sync::{Arc, Barrier},
};

#[derive(Parser)]
struct Command {
    /// The fault to raise
    #[arg(long)]
    fault: Fault,
    /// Raises the fault on a separate thread rather than the main thread
    #[arg(long)]
    use_thread: bool,
    /// Raises the fault on this many threads at the same time
    #[arg(long, default_value_t = 0)]
    threads: u32,
    /// Never enables the fault handler
    #[arg(long)]
    no_enable: bool,
    /// Disables the fault handler again before raising the fault
    #[arg(long)]
    disable: bool,
    /// Enables the fault handler only if the environment asks for it
    #[arg(long)]
    from_env: bool,
    /// Doesn't provision an alternate stack
    #[arg(long)]
    no_alt_stack: bool,
    /// Installs a handler for the fault's signal before the fault handler is
    /// enabled, which exits with 42
    #[arg(long)]
    prior_handler: bool,
    /// Releases the host lock before raising the fault
    #[arg(long)]
    release_lock: bool,
    /// Writes reports to this file instead of stderr
    #[arg(long)]
    output: Option<PathBuf>,
    /// Appends a line with the thread id to the report
    #[arg(long)]
    appender: bool,
}

extern "C" fn prior_handler(_sig: i32) {
    const MSG: &[u8] = b"prior handler\n";

    // SAFETY: both are async signal safe
    unsafe {
        libc::write(libc::STDERR_FILENO, MSG.as_ptr().cast(), MSG.len());
        libc::_exit(42);
    }
}

#[allow(unsafe_code)]
fn install_prior_handler(signal: Signal) -> anyhow::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_sigaction = prior_handler as *const () as usize;

        if libc::sigaction(signal.as_raw(), &sa, std::ptr::null_mut()) == -1 {
            anyhow::bail!(
                "failed to install prior handler: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    Ok(())
}

fn release_host_lock() {
    eprintln!("host lock released");
}

#[allow(unsafe_code)]
fn make_appender() -> Box<dyn fault_handler::ReportAppender> {
    unsafe {
        fault_handler::make_report_appender(|fault: &FaultInfo, report: &mut Report<'_>| {
            report
                .push_str("  appended for thread ")
                .push_dec(fault.tid)
                .newline();
        })
    }
}

fn real_main() -> anyhow::Result<()> {
    let cmd = Command::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .init();

    println!("pid: {}", std::process::id());

    let fault = cmd.fault;

    if cmd.prior_handler {
        install_prior_handler(fault.signal())?;
    }

    if cmd.from_env {
        let enabled = fault_handler::enable_from_env()?;
        println!("enabled: {enabled}");
    } else if !cmd.no_enable {
        let mut config = Config::default().alt_stack(!cmd.no_alt_stack);

        if let Some(path) = &cmd.output {
            let file = std::fs::File::create(path)?;
            config = config.output(OutputSink::from_file(file));
        }

        if cmd.release_lock {
            config = config.release_lock_with(release_host_lock);
        }

        if cmd.appender {
            config = config.appender(make_appender());
        }

        fault_handler::enable_with(config)?;
    }

    if cmd.disable {
        fault_handler::disable()?;
    }

    let release_lock = cmd.release_lock;
    let raise_fault = move || match fault {
        Fault::Bus => fault_handler::trigger_bus(),
        Fault::Fpe => fault_handler::trigger_fpe(),
        Fault::FpeRaised => sadness_generator::raise_signal(libc::SIGFPE),
        Fault::Illegal => fault_handler::trigger_illegal_instruction(),
        Fault::Segv => fault_handler::trigger_segfault(release_lock),
        Fault::StackOverflow => fault_handler::trigger_stack_overflow(),
    };

    if cmd.threads > 1 {
        let barrier = Arc::new(Barrier::new(cmd.threads as usize));

        let threads: Vec<_> = (0..cmd.threads)
            .map(|_| {
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    raise_fault();
                })
            })
            .collect();

        for thread in threads {
            if thread.join().is_err() {
                anyhow::bail!("failed to join faulting thread");
            }
        }
    } else if cmd.use_thread {
        if std::thread::spawn(raise_fault).join().is_err() {
            anyhow::bail!("failed to join faulting thread");
        }
    } else {
        raise_fault();
    }

    anyhow::bail!("we should have raised a signal and exited");
}

fn main() {
    // We want this program to crash after the fault handler reports, it
    // _shouldn't_ have errors that prevent that from happening, so emit an
    // error code if we do encounter an error so that we can fail the test
    if let Err(e) = real_main() {
        eprintln!("error: {e:#}");

        // When exiting due to a crash, the exit code will be 128 + the integer
        // signal number, at least on unixes
        #[allow(clippy::exit)]
        std::process::exit(222);
    }
}
