// lariat-test-utils: an in-process mock NATS server for integration tests.
//
// Each test starts its own isolated server on a random port, connects real
// clients over TCP, and scripts JetStream behavior by registering streams
// and consumers up front.  The mock speaks the actual wire protocol via
// `lariat-proto`, so clients exercise the same code paths they would against
// a real server.

mod mock_server;

pub use mock_server::{ConsumerConfig, MockServer};

/// Install a fmt subscriber honoring `RUST_LOG`, once per process.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
