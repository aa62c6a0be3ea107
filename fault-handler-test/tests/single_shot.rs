use fault_handler_test::*;

/// The handler that was installed before the fault handler runs after the
/// report, exactly once
#[test]
fn prior_handler_runs_after_report() {
    for fault in [Fault::Segv, Fault::FpeRaised] {
        let run = run_client(fault, &["--prior-handler"]);

        assert_eq!(run.status.code(), Some(42), "unexpected exit {}", run.status);
        assert_report(&run.stderr, fault, run.pid);

        let prior = run
            .stderr
            .find("prior handler")
            .expect("prior handler didn't run");
        assert!(run.stderr.find("Fatal error: ").unwrap() < prior);
        assert_eq!(run.stderr.matches("prior handler").count(), 1);
    }
}

#[test]
fn prior_handler_without_fault_handler() {
    let run = run_client(Fault::Segv, &["--prior-handler", "--no-enable"]);

    assert_eq!(run.status.code(), Some(42), "unexpected exit {}", run.status);
    assert_eq!(run.reports(), 0);
}
