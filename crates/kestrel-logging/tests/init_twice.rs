use kestrel_logging::{init_logging, LoggingOptions};

#[test]
fn repeated_initialization_falls_back_to_a_scoped_subscriber() {
    let first = init_logging(LoggingOptions::default());
    let second = init_logging(LoggingOptions {
        enable_spans: true,
        stderr: false,
        pid: 1,
    });
    tracing::info!("still logging");
    drop(second);
    drop(first);
}
