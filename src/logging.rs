//! Logging initialization
//!
//! The library only emits `tracing` events. Binaries (and tests that want to
//! see them) install a subscriber once through `init`.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "dbqueue=info";

static INIT_ONCE: Once = Once::new();

/// Install a fmt subscriber filtered by `RUST_LOG`, or `dbqueue=info`.
///
/// Repeated calls are no-ops. A subscriber installed elsewhere wins.
pub fn init() {
    init_with(DEFAULT_FILTER);
}

/// Like `init`, with an explicit fallback filter
pub fn init_with(default_filter: &str) {
    INIT_ONCE.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .try_init();
    });
}

/// Run `f` with a subscriber that records this thread's events, returning
/// the formatted output alongside `f`'s result.
#[cfg(test)]
pub(crate) fn capture<R>(f: impl FnOnce() -> R) -> (R, String) {
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;

    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let buffer = Arc::new(Mutex::new(Vec::new()));
    let writer = Arc::clone(&buffer);
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(move || Sink(Arc::clone(&writer)))
        .finish();

    let result = tracing::subscriber::with_default(subscriber, f);
    let output = String::from_utf8_lossy(&buffer.lock()).into_owned();
    (result, output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_idempotent() {
        init();
        init();
        init_with("dbqueue=debug");
    }

    #[test]
    fn test_capture_records_current_thread_events() {
        let (value, output) = capture(|| {
            tracing::warn!(shard = 3, "rebalancing");
            7
        });
        assert_eq!(value, 7);
        assert!(output.contains("WARN"));
        assert!(output.contains("rebalancing shard=3"));
    }
}
