#![allow(dead_code)]

use std::time::Duration;

use millstone::{Message, MessageStream, SubscriberConfig};
use tempfile::TempDir;

/// Creates a temp directory and returns it with a file DSN inside it.
/// The directory must stay alive for the duration of the test.
pub fn temp_db(name: &str) -> (TempDir, String) {
    let dir = TempDir::new().expect("create temp dir");
    let dsn = dir
        .path()
        .join(name)
        .to_str()
        .expect("utf-8 path")
        .to_string();
    (dir, dsn)
}

/// Subscriber configuration tuned for tests: fast polling, short ack
/// deadline, everything else default.
pub fn fast_subscriber_config(consumer_group: &str) -> SubscriberConfig {
    SubscriberConfig {
        consumer_group: consumer_group.to_string(),
        poll_interval: Duration::from_millis(50),
        ..SubscriberConfig::default()
    }
}

/// Receives the next message or panics after `timeout`.
pub async fn recv_within(stream: &MessageStream, timeout: Duration) -> Message {
    tokio::time::timeout(timeout, stream.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("subscription stream closed unexpectedly")
}

/// Polls `f` until it returns `Some`, panicking after `timeout`.
pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Installs a fmt tracing subscriber honoring `RUST_LOG`; safe to call
/// from every test.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
