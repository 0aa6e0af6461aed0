//! Shared helpers for integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use vatlink::{Error, ErrorReporter};

static INIT: Once = Once::new();

/// Installs a test-writer `tracing` subscriber once per test binary.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vatlink=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        ::tracing::info!(test = %$name, "==== test phase ====");
    };
}

#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        ::tracing::info!(section = %$name, "---- section ----");
    };
}

#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        ::tracing::info!(test = %$name, "==== test complete ====");
    };
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Reporter that keeps every error it sees.
#[derive(Default)]
pub struct Collect(Mutex<Vec<Error>>);

impl Collect {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<String> {
        self.0.lock().iter().map(ToString::to_string).collect()
    }
}

impl ErrorReporter for Collect {
    fn report_error(&self, err: &Error) {
        tracing::debug!(error = %err, "reported");
        self.0.lock().push(err.clone());
    }
}
