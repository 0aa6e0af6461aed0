//! E2E: a scripted peer drives one connection message by message.

#[macro_use]
mod common;

use common::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use vatlink::message::{
    Bootstrap, Call, CapDescriptor, Exception, Finish, Message, MessageTarget, Release, Return,
    ReturnBody, SendResultsTo, WirePayload,
};
use vatlink::transport::{PipeTransport, Transport, pipe};
use vatlink::{
    CallContext, CancelReason, CancelToken, Client, Conn, ExceptionType, Method, Options, Payload,
    Request, Result, Server, Value,
};

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

struct Echo;

impl Server for Echo {
    fn dispatch(&self, call: CallContext) -> Result<Payload> {
        Ok(call.into_params())
    }
}

/// Holds its call until the caller finishes it, then returns a fresh
/// capability anyway.
struct Gate(Arc<AtomicUsize>);

impl Server for Gate {
    fn dispatch(&self, call: CallContext) -> Result<Payload> {
        self.0.fetch_add(1, Ordering::SeqCst);
        call.cancel_token().wait();
        Ok(Payload::capability(Client::new(Echo)))
    }
}

fn next(peer: &PipeTransport) -> Message {
    peer.recv_timeout(Duration::from_secs(5))
        .expect("pipe open")
        .expect("message within timeout")
}

fn bootstrap_export(peer: &PipeTransport, question_id: u32) -> u32 {
    peer.send_message(Message::Bootstrap(Bootstrap { question_id }))
        .unwrap();
    match next(peer) {
        Message::Return(Return {
            answer_id,
            body: ReturnBody::Results(wire),
            ..
        }) if answer_id == question_id => match wire.cap_table[..] {
            [CapDescriptor::SenderHosted(id)] => id,
            ref other => panic!("unexpected cap table {other:?}"),
        },
        other => panic!("expected results, got {other:?}"),
    }
}

fn call_on(question_id: u32, export: u32, params: WirePayload) -> Message {
    Message::Call(Call {
        question_id,
        target: MessageTarget::ImportedCap(export),
        interface_id: 1,
        method_id: 0,
        params,
        send_results_to: SendResultsTo::Caller,
    })
}

fn expect_abort(peer: &PipeTransport) -> Exception {
    loop {
        match next(peer) {
            Message::Abort(exc) => return exc,
            other => tracing::debug!(?other, "skipping"),
        }
    }
}

#[test]
fn e2e_missing_bootstrap_returns_exception() {
    init_test("e2e_missing_bootstrap_returns_exception");
    let (local, peer) = pipe();
    let conn = Conn::new(local, Options::new()).unwrap();

    peer.send_message(Message::Bootstrap(Bootstrap { question_id: 0 }))
        .unwrap();
    match next(&peer) {
        Message::Return(Return {
            answer_id: 0,
            body: ReturnBody::Exception(exc),
            ..
        }) => {
            assert_eq!(exc.kind, ExceptionType::Failed);
            assert_eq!(exc.reason, "vat does not expose a public/bootstrap interface");
        }
        other => panic!("expected exception return, got {other:?}"),
    }
    assert_eq!(conn.stats().answers, 1);

    peer.send_message(Message::Finish(Finish {
        question_id: 0,
        release_result_caps: false,
    }))
    .unwrap();
    assert!(wait_until(Duration::from_secs(5), || conn.stats().answers == 0));
    conn.close().unwrap();
    test_complete!("e2e_missing_bootstrap_returns_exception");
}

#[test]
fn e2e_unknown_message_is_echoed_and_connection_survives() {
    init_test("e2e_unknown_message_is_echoed_and_connection_survives");
    let reporter = Collect::new();
    let (local, peer) = pipe();
    let conn = Conn::new(
        local,
        Options::new()
            .with_bootstrap(Client::new(Echo))
            .with_error_reporter(reporter.clone()),
    )
    .unwrap();

    test_section!("unknown kind");
    peer.send_message(Message::Unknown(5)).unwrap();
    assert_eq!(
        next(&peer),
        Message::Unimplemented(Box::new(Message::Unknown(5)))
    );
    assert!(
        reporter
            .messages()
            .iter()
            .any(|m| m.contains("unknown message type 5"))
    );

    test_section!("unsupported result routing");
    let call = Call {
        question_id: 4,
        target: MessageTarget::ImportedCap(0),
        interface_id: 1,
        method_id: 0,
        params: WirePayload::default(),
        send_results_to: SendResultsTo::Yourself,
    };
    peer.send_message(Message::Call(call.clone())).unwrap();
    assert_eq!(
        next(&peer),
        Message::Unimplemented(Box::new(Message::Call(call)))
    );

    test_section!("echoes from the peer are ignored");
    peer.send_message(Message::Unimplemented(Box::new(Message::Unknown(9))))
        .unwrap();

    test_section!("still serving");
    peer.send_message(Message::Bootstrap(Bootstrap { question_id: 1 }))
        .unwrap();
    match next(&peer) {
        Message::Return(Return {
            answer_id: 1,
            body: ReturnBody::Results(wire),
            ..
        }) => {
            assert_eq!(wire.content, Value::Capability(0));
            assert!(matches!(wire.cap_table[..], [CapDescriptor::SenderHosted(_)]));
        }
        other => panic!("expected results, got {other:?}"),
    }
    assert!(!conn.done().is_closed());
    conn.close().unwrap();
    test_complete!("e2e_unknown_message_is_echoed_and_connection_survives");
}

#[test]
fn e2e_over_release_aborts_connection() {
    init_test("e2e_over_release_aborts_connection");
    let reporter = Collect::new();
    let (local, peer) = pipe();
    let conn = Conn::new(
        local,
        Options::new()
            .with_bootstrap(Client::new(Echo))
            .with_error_reporter(reporter.clone()),
    )
    .unwrap();

    peer.send_message(Message::Bootstrap(Bootstrap { question_id: 0 }))
        .unwrap();
    let export = match next(&peer) {
        Message::Return(Return {
            body: ReturnBody::Results(wire),
            ..
        }) => match wire.cap_table[..] {
            [CapDescriptor::SenderHosted(id)] => id,
            ref other => panic!("unexpected cap table {other:?}"),
        },
        other => panic!("expected results, got {other:?}"),
    };

    peer.send_message(Message::Release(Release {
        id: export,
        reference_count: 2,
    }))
    .unwrap();
    let abort = expect_abort(&peer);
    assert_eq!(abort.kind, ExceptionType::Failed);
    assert!(
        abort.reason.contains("released too many references"),
        "{}",
        abort.reason
    );
    assert!(conn.done().wait_timeout(Duration::from_secs(5)));
    assert!(
        reporter
            .messages()
            .iter()
            .any(|m| m.contains("released too many references"))
    );
    test_complete!("e2e_over_release_aborts_connection");
}

#[test]
fn e2e_return_for_unknown_question_aborts_connection() {
    init_test("e2e_return_for_unknown_question_aborts_connection");
    let (local, peer) = pipe();
    let conn = Conn::new(local, Options::new()).unwrap();

    peer.send_message(Message::Return(Return {
        answer_id: 7,
        release_param_caps: false,
        body: ReturnBody::Canceled,
    }))
    .unwrap();
    let abort = expect_abort(&peer);
    assert!(abort.reason.contains("question 7 does not exist"), "{}", abort.reason);
    assert!(conn.done().wait_timeout(Duration::from_secs(5)));
    test_complete!("e2e_return_for_unknown_question_aborts_connection");
}

#[test]
fn e2e_remote_abort_closes_and_fails_questions() {
    init_test("e2e_remote_abort_closes_and_fails_questions");
    let reporter = Collect::new();
    let (local, peer) = pipe();
    let conn = Conn::new(local, Options::new().with_error_reporter(reporter.clone())).unwrap();

    let boot = conn.bootstrap();
    assert!(matches!(
        next(&peer),
        Message::Bootstrap(Bootstrap { question_id: 0 })
    ));
    peer.send_message(Message::Abort(Exception {
        kind: ExceptionType::Disconnected,
        reason: "going away".into(),
    }))
    .unwrap();
    assert!(conn.done().wait_timeout(Duration::from_secs(5)));

    let err = boot
        .call_wait(vatlink::Method::new(1, 0), Payload::default())
        .unwrap_err();
    assert!(err.is_disconnected(), "{err}");
    assert!(
        reporter
            .messages()
            .iter()
            .any(|m| m.contains("remote abort: going away"))
    );
    test_complete!("e2e_remote_abort_closes_and_fails_questions");
}

#[test]
fn e2e_finish_before_return_releases_result_caps() {
    init_test("e2e_finish_before_return_releases_result_caps");
    let started = Arc::new(AtomicUsize::new(0));
    let (local, peer) = pipe();
    let conn = Conn::new(
        local,
        Options::new().with_bootstrap(Client::new(Gate(Arc::clone(&started)))),
    )
    .unwrap();
    let gate = bootstrap_export(&peer, 0);

    test_section!("finish with release while the call runs");
    peer.send_message(call_on(1, gate, WirePayload::default()))
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        started.load(Ordering::SeqCst) == 1
    }));
    peer.send_message(Message::Finish(Finish {
        question_id: 1,
        release_result_caps: true,
    }))
    .unwrap();

    test_section!("return still goes out, then its caps are released");
    match next(&peer) {
        Message::Return(Return {
            answer_id: 1,
            body: ReturnBody::Results(wire),
            ..
        }) => match wire.cap_table[..] {
            [CapDescriptor::SenderHosted(id)] => assert_ne!(id, gate),
            ref other => panic!("unexpected cap table {other:?}"),
        },
        other => panic!("expected results, got {other:?}"),
    }
    assert!(
        wait_until(Duration::from_secs(5), || {
            let stats = conn.stats();
            stats.answers == 1 && stats.exports == 1
        }),
        "{:?}",
        conn.stats()
    );
    conn.close().unwrap();
    test_complete!("e2e_finish_before_return_releases_result_caps");
}

#[test]
fn e2e_canceled_question_sends_one_finish_and_holds_its_id() {
    init_test("e2e_canceled_question_sends_one_finish_and_holds_its_id");
    let (local, peer) = pipe();
    let conn = Conn::new(local, Options::new()).unwrap();
    let method = Method::new(1, 0);

    test_section!("bootstrap settles and its id is freed");
    let boot = conn.bootstrap();
    assert!(matches!(
        next(&peer),
        Message::Bootstrap(Bootstrap { question_id: 0 })
    ));
    peer.send_message(Message::Return(Return {
        answer_id: 0,
        release_param_caps: false,
        body: ReturnBody::Results(WirePayload {
            content: Value::Capability(0),
            cap_table: vec![CapDescriptor::SenderHosted(0)],
        }),
    }))
    .unwrap();
    assert!(matches!(
        next(&peer),
        Message::Finish(Finish { question_id: 0, .. })
    ));
    assert!(wait_until(Duration::from_secs(5), || {
        conn.stats().questions == 0 && boot.resolved().brand() == "import"
    }));

    test_section!("cancel before the return");
    let token = CancelToken::new();
    let canceled = boot.send(Request::new(method).with_cancel(token.clone()));
    let q = match next(&peer) {
        Message::Call(call) => call.question_id,
        other => panic!("expected call, got {other:?}"),
    };
    token.cancel(CancelReason::user("caller gave up"));
    assert_eq!(
        next(&peer),
        Message::Finish(Finish {
            question_id: q,
            release_result_caps: true,
        })
    );
    assert!(canceled.wait().unwrap_err().message().contains("call canceled"));
    assert!(!token.cancel(CancelReason::user("again")));

    test_section!("the id stays taken until the peer returns");
    let second = boot.call(method, Payload::default());
    match next(&peer) {
        Message::Call(call) => assert_ne!(call.question_id, q),
        other => panic!("expected call, got {other:?}"),
    }
    assert_eq!(conn.stats().questions, 2);

    peer.send_message(Message::Return(Return {
        answer_id: q,
        release_param_caps: false,
        body: ReturnBody::Canceled,
    }))
    .unwrap();
    assert!(wait_until(Duration::from_secs(5), || conn.stats().questions == 1));
    assert!(
        peer.recv_timeout(Duration::from_millis(50))
            .expect("pipe open")
            .is_none(),
        "no second finish"
    );

    test_section!("retired id is reused");
    let third = boot.call(method, Payload::default());
    match next(&peer) {
        Message::Call(call) => assert_eq!(call.question_id, q),
        other => panic!("expected call, got {other:?}"),
    }
    drop((canceled, second, third, boot));
    conn.close().unwrap();
    test_complete!("e2e_canceled_question_sends_one_finish_and_holds_its_id");
}

#[test]
fn e2e_third_party_capability_is_reported_not_fatal() {
    init_test("e2e_third_party_capability_is_reported_not_fatal");
    let reporter = Collect::new();
    let (local, peer) = pipe();
    let conn = Conn::new(
        local,
        Options::new()
            .with_bootstrap(Client::new(Echo))
            .with_error_reporter(reporter.clone()),
    )
    .unwrap();
    let echo = bootstrap_export(&peer, 0);

    let params = WirePayload {
        content: Value::Capability(0),
        cap_table: vec![CapDescriptor::ThirdPartyHosted(Value::text("vat-3"))],
    };
    peer.send_message(call_on(1, echo, params)).unwrap();
    assert!(matches!(
        next(&peer),
        Message::Return(Return { answer_id: 1, .. })
    ));
    assert!(
        reporter
            .messages()
            .iter()
            .any(|m| m.contains("third-party capabilities are not supported"))
    );
    assert!(!conn.done().is_closed());
    conn.close().unwrap();
    test_complete!("e2e_third_party_capability_is_reported_not_fatal");
}
