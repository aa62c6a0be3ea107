use fault_handler::{Disposition, Signal};

fn dispositions() -> Vec<Disposition> {
    Signal::SUPPORTED
        .iter()
        .map(|sig| sig.disposition().expect("failed to query disposition"))
        .collect()
}

#[test]
fn enable_and_disable_are_idempotent() {
    let original = dispositions();

    // Disabling when never enabled does nothing
    assert!(!fault_handler::is_enabled());
    fault_handler::disable().unwrap();
    assert!(!fault_handler::is_enabled());
    assert_eq!(dispositions(), original);

    fault_handler::enable().unwrap();
    assert!(fault_handler::is_enabled());
    let enabled = dispositions();

    // Enabling again must not save our own handler as the previous disposition
    fault_handler::enable().unwrap();
    assert!(fault_handler::is_enabled());
    assert_eq!(dispositions(), enabled);

    for (sig, previous) in Signal::SUPPORTED.iter().zip(&original) {
        let record = fault_handler::controller().record(*sig);
        assert!(record.installed);
        assert_eq!(record.previous, Some(*previous));
    }

    fault_handler::disable().unwrap();
    assert!(!fault_handler::is_enabled());
    assert_eq!(dispositions(), original);

    fault_handler::disable().unwrap();
    assert!(!fault_handler::is_enabled());
    assert_eq!(dispositions(), original);

    for sig in Signal::SUPPORTED {
        assert!(!fault_handler::controller().record(*sig).installed);
    }
}
