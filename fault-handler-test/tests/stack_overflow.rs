use fault_handler_test::*;

#[test]
fn stack_overflow_simple() {
    if !fault_handler::CAPABILITIES.alt_stack {
        return;
    }

    let run = run_test(Fault::StackOverflow, false);

    // The report comes before Rust's own stack overflow message, if any
    if let Some(overflowed) = run.stderr.find("has overflowed its stack") {
        assert!(run.stderr.find("Fatal error: ").unwrap() < overflowed);
    }
}
