use fault_handler_test::*;

/// Asserts every report is a well formed segfault report from the client, and
/// returns the thread ids that were reported
fn reported_threads(run: &Run) -> Vec<u64> {
    let process = format!("  process: {}, thread: ", run.pid);

    let mut threads: Vec<u64> = run
        .stderr
        .split("Fatal error: ")
        .skip(1)
        .map(|report| {
            assert!(report.starts_with("Segmentation fault\n"));

            let line = report
                .lines()
                .find(|line| line.starts_with(&process))
                .expect("report is missing the process line");
            line[process.len()..].parse().expect("invalid thread id")
        })
        .collect();

    threads.sort_unstable();
    threads
}

/// Every thread that faults at the same time gets its report out before the
/// process dies
#[test]
fn concurrent_faults() {
    for _ in 0..10 {
        let run = run_client(Fault::Segv, &["--threads", "2"]);

        run.assert_killed_by(Fault::Segv);
        assert_eq!(run.reports(), 2);

        let mut threads = reported_threads(&run);
        threads.dedup();
        assert_eq!(threads.len(), 2, "both reports are from the same thread");
    }
}

#[test]
fn concurrent_faults_many_threads() {
    let run = run_client(Fault::Segv, &["--threads", "4"]);

    run.assert_killed_by(Fault::Segv);
    assert_eq!(run.reports(), 4);

    let mut threads = reported_threads(&run);
    threads.dedup();
    assert_eq!(threads.len(), 4);
}

/// Appended output is flushed by each thread before any of them restores the
/// handlers
#[test]
fn concurrent_faults_with_appender() {
    for _ in 0..10 {
        let run = run_client(Fault::Segv, &["--threads", "2", "--appender"]);

        run.assert_killed_by(Fault::Segv);
        assert_eq!(run.reports(), 2);

        let mut appended: Vec<u64> = run
            .stderr
            .lines()
            .filter_map(|line| line.strip_prefix("  appended for thread "))
            .map(|tid| tid.parse().expect("invalid thread id"))
            .collect();
        appended.sort_unstable();

        assert_eq!(appended, reported_threads(&run));
    }
}
