//! E2E: closing a connection with calls in flight.

#[macro_use]
mod common;

use common::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use vatlink::transport::pipe;
use vatlink::{CallContext, Client, Conn, Error, Method, Options, Payload, Result, Server};

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

const MAKE: Method = Method::new(0x50, 0);
const STALL: Method = Method::new(0x60, 0);

#[derive(Default)]
struct Counts {
    started: AtomicUsize,
    canceled: AtomicUsize,
    dropped: AtomicUsize,
}

/// Blocks until its call is canceled.
struct Stall(Arc<Counts>);

impl Server for Stall {
    fn dispatch(&self, call: CallContext) -> Result<Payload> {
        self.0.started.fetch_add(1, Ordering::SeqCst);
        let reason = call.cancel_token().wait();
        self.0.canceled.fetch_add(1, Ordering::SeqCst);
        Err(Error::failed(format!("stalled call canceled: {reason:?}")))
    }

    fn shutdown(&self) {
        self.0.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Makes a fresh `Stall` per call.
struct StallFactory(Arc<Counts>);

impl Server for StallFactory {
    fn dispatch(&self, _call: CallContext) -> Result<Payload> {
        Ok(Payload::capability(Client::new(Stall(Arc::clone(&self.0)))))
    }
}

#[test]
fn e2e_close_cancels_in_flight_answers_and_releases_once() {
    init_test("e2e_close_cancels_in_flight_answers_and_releases_once");
    let counts = Arc::new(Counts::default());
    let (a, b) = pipe();
    let server = Conn::new(
        a,
        Options::new().with_bootstrap(Client::new(StallFactory(Arc::clone(&counts)))),
    )
    .unwrap();
    let client = Conn::new(b, Options::new()).unwrap();

    test_section!("three stalled calls on three objects");
    let factory = client.bootstrap();
    let stalls: Vec<_> = (0..3)
        .map(|_| factory.call(MAKE, Payload::default()).pipeline(&[]))
        .collect();
    let pending: Vec<_> = stalls
        .iter()
        .map(|s| s.call(STALL, Payload::default()))
        .collect();
    assert!(wait_until(Duration::from_secs(5), || {
        counts.started.load(Ordering::SeqCst) == 3
    }));
    assert!(server.stats().answers >= 3);

    test_section!("close the serving side");
    server.close().unwrap();
    assert!(server.done().is_closed());
    assert_eq!(counts.canceled.load(Ordering::SeqCst), 3);
    let stats = server.stats();
    assert_eq!((stats.answers, stats.exports, stats.tasks), (0, 0, 0));
    assert!(
        wait_until(Duration::from_secs(5), || counts.dropped.load(Ordering::SeqCst) == 3),
        "dropped {}",
        counts.dropped.load(Ordering::SeqCst)
    );

    test_section!("caller side observes the abort");
    for p in &pending {
        assert!(p.wait().is_err());
    }
    assert!(client.done().wait_timeout(Duration::from_secs(5)));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(counts.dropped.load(Ordering::SeqCst), 3);

    let err = client.close().unwrap_err();
    assert!(err.is_disconnected());
    test_complete!("e2e_close_cancels_in_flight_answers_and_releases_once");
}

#[test]
fn e2e_caller_cancel_reaches_server() {
    init_test("e2e_caller_cancel_reaches_server");
    let counts = Arc::new(Counts::default());
    let (a, b) = pipe();
    let server = Conn::new(
        a,
        Options::new().with_bootstrap(Client::new(Stall(Arc::clone(&counts)))),
    )
    .unwrap();
    let client = Conn::new(b, Options::new()).unwrap();

    let stall = client.bootstrap();
    let token = vatlink::CancelToken::new();
    let answer = stall.send(
        vatlink::Request::new(STALL).with_cancel(token.clone()),
    );
    assert!(wait_until(Duration::from_secs(5), || {
        counts.started.load(Ordering::SeqCst) == 1
    }));

    token.cancel(vatlink::CancelReason::user("caller gave up"));
    let err = answer.wait().unwrap_err();
    assert!(err.message().contains("call canceled"), "{err}");
    assert!(wait_until(Duration::from_secs(5), || {
        counts.canceled.load(Ordering::SeqCst) == 1
    }));
    assert!(wait_until(Duration::from_secs(5), || server.stats().answers == 0));
    assert!(wait_until(Duration::from_secs(5), || client.stats().questions == 0));

    drop((stall, answer));
    client.close().unwrap();
    assert!(server.done().wait_timeout(Duration::from_secs(5)));
    test_complete!("e2e_caller_cancel_reaches_server");
}
