use std::sync::Once;

static INIT: Once = Once::new();

// RUST_LOG=segstore=trace cargo test -- --nocapture
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
