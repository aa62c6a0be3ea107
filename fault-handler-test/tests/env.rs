use fault_handler_test::*;

fn run_with_env(fault: Fault, vars: &[(&str, &str)]) -> std::process::Output {
    let mut cmd_path = std::env::current_exe().expect("failed to get exe path");
    cmd_path.pop();
    if cmd_path.ends_with("deps") {
        cmd_path.pop();
    }
    cmd_path.push("crash-client");

    std::process::Command::new(cmd_path)
        .args(["--fault", &fault.to_string(), "--from-env"])
        .env_remove(fault_handler::ENABLE_VAR)
        .env_remove(fault_handler::SIGNALS_VAR)
        .envs(vars.iter().copied())
        .output()
        .expect("failed to run crash-client")
}

#[test]
fn enabled_from_env() {
    let output = run_with_env(Fault::Segv, &[(fault_handler::ENABLE_VAR, "1")]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(stdout.contains("enabled: true"));
    assert!(stderr.contains("Fatal error: Segmentation fault"));
}

#[test]
fn not_enabled_without_env() {
    let output = run_with_env(Fault::Segv, &[]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(stdout.contains("enabled: false"));
    assert!(!stderr.contains("Fatal error: "));

    let output = run_with_env(Fault::Segv, &[(fault_handler::ENABLE_VAR, "0")]);
    assert!(String::from_utf8_lossy(&output.stdout).contains("enabled: false"));
}

#[test]
fn signals_narrowed_from_env() {
    let vars = [
        (fault_handler::ENABLE_VAR, "1"),
        (fault_handler::SIGNALS_VAR, "fpe"),
    ];

    let output = run_with_env(Fault::Segv, &vars);
    assert!(!String::from_utf8_lossy(&output.stderr).contains("Fatal error: "));

    let output = run_with_env(Fault::Fpe, &vars);
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("Fatal error: Floating point exception")
    );
}

#[test]
fn invalid_signals_in_env() {
    let output = run_with_env(
        Fault::Segv,
        &[
            (fault_handler::ENABLE_VAR, "1"),
            (fault_handler::SIGNALS_VAR, "segv,hup"),
        ],
    );

    assert_eq!(output.status.code(), Some(222));
}
