use fault_handler::{Config, Error, OutputSink, Signal};

#[test]
fn rejects_unwritable_output() {
    let before = Signal::Segv.disposition().unwrap();

    let file = std::fs::File::open(concat!(env!("CARGO_MANIFEST_DIR"), "/Cargo.toml"))
        .expect("failed to open manifest");

    let err = fault_handler::enable_with(Config::default().output(OutputSink::from_file(file)))
        .unwrap_err();
    assert!(
        matches!(&err, Error::Io(io) if io.kind() == std::io::ErrorKind::PermissionDenied),
        "unexpected error {err:?}"
    );

    // Nothing was installed
    assert!(!fault_handler::is_enabled());
    assert_eq!(Signal::Segv.disposition().unwrap(), before);
    for sig in Signal::SUPPORTED {
        assert!(!fault_handler::controller().record(*sig).installed);
    }

    // A valid output still works afterwards
    fault_handler::enable().unwrap();
    assert!(fault_handler::is_enabled());
    fault_handler::disable().unwrap();
    assert_eq!(Signal::Segv.disposition().unwrap(), before);
}
