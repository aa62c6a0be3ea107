use fault_handler_test::*;

#[test]
fn report_written_to_file() {
    let path = std::env::temp_dir().join(format!(
        "fault-handler-test-output-{}.txt",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);

    let run = run_client(Fault::Segv, &["--output", path.to_str().unwrap()]);

    run.assert_killed_by(Fault::Segv);
    assert_eq!(run.reports(), 0, "report was written to stderr");

    let report = std::fs::read_to_string(&path).expect("failed to read report");
    let _ = std::fs::remove_file(&path);

    assert_report(&report, Fault::Segv, run.pid);
}
