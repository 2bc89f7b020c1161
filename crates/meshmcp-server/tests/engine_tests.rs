//! Engine integration tests against a scripted mock transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use meshmcp_protocol::{ErrorKind, McpError, McpResult, ParsedMessage, classify};
use meshmcp_server::{
    ConnectionId, EngineConfig, Feature, FeatureContext, FnHandler, IncomingCallback,
    MessageContext, MessageInfo, ProtocolEngine, RequestOptions, SendOptions, ServerTransport,
    Session,
};

/// A transport that records outgoing sends and lets tests inject incoming
/// messages through the engine-installed callback.
#[derive(Default)]
struct MockTransport {
    callback: Mutex<Option<IncomingCallback>>,
    sent: Mutex<Vec<(Value, SendOptions)>>,
    notify: tokio::sync::Notify,
    fail_sends: AtomicBool,
}

impl MockTransport {
    fn deliver(&self, raw: Value, session: Option<Session>) {
        let callback = self
            .callback
            .lock()
            .clone()
            .expect("engine installed no callback");
        let message: ParsedMessage = classify(raw).expect("test message must classify");
        let ctx = MessageContext {
            instance_id: "mock".to_string(),
            session,
        };
        callback(message, ctx, MessageInfo::default());
    }

    async fn wait_for_sends(&self, count: usize) -> Vec<(Value, SendOptions)> {
        for _ in 0..200 {
            {
                let sent = self.sent.lock();
                if sent.len() >= count {
                    return sent.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transport never saw {count} outgoing messages");
    }

    fn sent_now(&self) -> Vec<(Value, SendOptions)> {
        self.sent.lock().clone()
    }
}

#[async_trait::async_trait]
impl ServerTransport for MockTransport {
    fn set_incoming(&self, callback: IncomingCallback) {
        *self.callback.lock() = Some(callback);
    }

    async fn connect(&self) -> McpResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> McpResult<()> {
        Ok(())
    }

    async fn send(&self, message: Value, options: SendOptions) -> McpResult<()> {
        if self.fail_sends.load(Ordering::Acquire) {
            return Err(McpError::transport("send refused"));
        }
        self.sent.lock().push((message, options));
        self.notify.notify_waiters();
        Ok(())
    }
}

struct EchoFeature;

impl Feature for EchoFeature {
    fn name(&self) -> &str {
        "echo"
    }

    fn initialize(&self, ctx: &FeatureContext<'_>) -> McpResult<()> {
        ctx.register_handler(
            "test/echo",
            Arc::new(FnHandler::new(|_facade, message, _ctx, _info| async move {
                Ok(json!({"echo": message.params.unwrap_or(Value::Null)}))
            })),
        )
    }
}

async fn engine_with_transport() -> (ProtocolEngine, Arc<MockTransport>, ConnectionId) {
    let engine = ProtocolEngine::new(EngineConfig::default());
    let transport = Arc::new(MockTransport::default());
    let connection = engine
        .connect(transport.clone() as Arc<dyn ServerTransport>)
        .await
        .unwrap();
    (engine, transport, connection)
}

#[tokio::test]
async fn request_dispatch_emits_success_envelope() {
    let (engine, transport, _) = engine_with_transport().await;
    engine.add_feature(&EchoFeature).unwrap();

    let session = Session::new("s1");
    transport.deliver(
        json!({"jsonrpc": "2.0", "id": 1, "method": "test/echo", "params": {"x": 7}}),
        Some(session),
    );

    let sent = transport.wait_for_sends(1).await;
    let (envelope, options) = &sent[0];
    assert_eq!(envelope["jsonrpc"], "2.0");
    assert_eq!(envelope["id"], 1);
    assert_eq!(envelope["result"]["echo"]["x"], 7);
    assert_eq!(options.session_id.as_deref(), Some("s1"));
    assert_eq!(options.request_id.as_ref().unwrap().to_string(), "1");
}

#[tokio::test]
async fn unknown_method_emits_method_not_found() {
    let (engine, transport, _) = engine_with_transport().await;
    let _ = engine;

    transport.deliver(
        json!({"jsonrpc": "2.0", "id": "r1", "method": "no/such"}),
        Some(Session::new("s1")),
    );

    let sent = transport.wait_for_sends(1).await;
    assert_eq!(sent[0].0["error"]["code"], -32601);
    assert_eq!(sent[0].0["id"], "r1");
}

#[tokio::test]
async fn ping_is_answered_without_a_handler() {
    let (_engine, transport, _) = engine_with_transport().await;

    transport.deliver(
        json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}),
        Some(Session::new("s1")),
    );

    let sent = transport.wait_for_sends(1).await;
    assert_eq!(sent[0].0["result"], json!({}));
}

#[tokio::test]
async fn handler_error_becomes_internal_error_envelope() {
    let (engine, transport, _) = engine_with_transport().await;

    struct FailingFeature;
    impl Feature for FailingFeature {
        fn name(&self) -> &str {
            "failing"
        }
        fn initialize(&self, ctx: &FeatureContext<'_>) -> McpResult<()> {
            ctx.register_handler(
                "test/fail",
                Arc::new(FnHandler::new(|_f, _m, _c, _i| async move {
                    Err(McpError::handler("boom"))
                })),
            )
        }
    }
    engine.add_feature(&FailingFeature).unwrap();

    transport.deliver(
        json!({"jsonrpc": "2.0", "id": 3, "method": "test/fail"}),
        Some(Session::new("s1")),
    );

    let sent = transport.wait_for_sends(1).await;
    assert_eq!(sent[0].0["error"]["code"], -32603);
    assert_eq!(sent[0].0["error"]["message"], "boom");
}

#[tokio::test]
async fn cancelled_request_produces_no_response() {
    let (engine, transport, _) = engine_with_transport().await;

    struct SlowFeature;
    impl Feature for SlowFeature {
        fn name(&self) -> &str {
            "slow"
        }
        fn initialize(&self, ctx: &FeatureContext<'_>) -> McpResult<()> {
            ctx.register_handler(
                "test/slow",
                Arc::new(FnHandler::new(|_f, _m, _c, info| async move {
                    // A well-behaved handler observes its abort signal
                    tokio::select! {
                        () = info.cancellation.cancelled() => Err(McpError::cancelled("aborted")),
                        () = tokio::time::sleep(Duration::from_secs(5)) => Ok(json!({})),
                    }
                })),
            )
        }
    }
    engine.add_feature(&SlowFeature).unwrap();

    let session = Session::new("s1");
    transport.deliver(
        json!({"jsonrpc": "2.0", "id": 4, "method": "test/slow"}),
        Some(session.clone()),
    );
    tokio::time::sleep(Duration::from_millis(30)).await;
    transport.deliver(
        json!({
            "jsonrpc": "2.0",
            "method": "notifications/cancelled",
            "params": {"requestId": 4, "reason": "test"}
        }),
        Some(session),
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(transport.sent_now().is_empty(), "cancelled request must not reply");
}

#[tokio::test]
async fn outgoing_request_resolves_with_correlated_response() {
    let (engine, transport, connection) = engine_with_transport().await;

    let engine2 = engine.clone();
    let transport2 = transport.clone();
    let conn2 = connection.clone();
    let waiter = tokio::spawn(async move {
        engine2
            .send(
                &conn2,
                json!({"jsonrpc": "2.0", "id": "out-1", "method": "elicitation/create"}),
                RequestOptions::session("s1"),
            )
            .await
    });

    // The request reached the transport with request-scoped routing
    let sent = transport.wait_for_sends(1).await;
    assert_eq!(sent[0].1.request_id.as_ref().unwrap().to_string(), "out-1");

    transport2.deliver(
        json!({"jsonrpc": "2.0", "id": "out-1", "result": {"answer": 42}}),
        Some(Session::new("s1")),
    );

    let response = waiter.await.unwrap().unwrap().unwrap();
    assert_eq!(response.result().unwrap()["answer"], 42);
    assert_eq!(engine.pending_count(), 0);
}

#[tokio::test]
async fn outgoing_request_rejects_on_error_envelope() {
    let (engine, transport, connection) = engine_with_transport().await;

    let engine2 = engine.clone();
    let conn2 = connection.clone();
    let waiter = tokio::spawn(async move {
        engine2
            .send(
                &conn2,
                json!({"jsonrpc": "2.0", "id": "out-2", "method": "elicitation/create"}),
                RequestOptions::session("s1"),
            )
            .await
    });

    transport.wait_for_sends(1).await;
    transport.deliver(
        json!({
            "jsonrpc": "2.0",
            "id": "out-2",
            "error": {"code": -32602, "message": "bad params"}
        }),
        Some(Session::new("s1")),
    );

    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidParams);
    assert_eq!(engine.pending_count(), 0);
}

#[tokio::test]
async fn outgoing_request_times_out() {
    let (engine, transport, connection) = engine_with_transport().await;

    let result = engine
        .send(
            &connection,
            json!({"jsonrpc": "2.0", "id": "out-3", "method": "elicitation/create"}),
            RequestOptions::session("s1").with_timeout(Duration::from_millis(50)),
        )
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(err.message, "Request timeout");
    assert_eq!(engine.pending_count(), 0);
    drop(transport);
}

#[tokio::test]
async fn external_signal_aborts_outgoing_request() {
    let (engine, transport, connection) = engine_with_transport().await;
    let signal = CancellationToken::new();

    let engine2 = engine.clone();
    let conn2 = connection.clone();
    let signal2 = signal.clone();
    let waiter = tokio::spawn(async move {
        engine2
            .send(
                &conn2,
                json!({"jsonrpc": "2.0", "id": "out-4", "method": "elicitation/create"}),
                RequestOptions::session("s1").with_signal(signal2),
            )
            .await
    });

    transport.wait_for_sends(1).await;
    signal.cancel();

    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Internal);
    assert!(err.message.contains("external signal"));
    assert_eq!(engine.pending_count(), 0);
}

#[tokio::test]
async fn transport_send_failure_cleans_pending() {
    let (engine, transport, connection) = engine_with_transport().await;
    transport.fail_sends.store(true, Ordering::Release);

    let err = engine
        .send(
            &connection,
            json!({"jsonrpc": "2.0", "id": "out-5", "method": "elicitation/create"}),
            RequestOptions::session("s1"),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Internal);
    assert_eq!(engine.pending_count(), 0);
}

#[tokio::test]
async fn progress_notifications_reach_the_callback_and_reset_timeout() {
    let (engine, transport, connection) = engine_with_transport().await;
    let progress_seen = Arc::new(AtomicUsize::new(0));

    let seen = progress_seen.clone();
    let engine2 = engine.clone();
    let conn2 = connection.clone();
    let waiter = tokio::spawn(async move {
        engine2
            .send(
                &conn2,
                json!({
                    "jsonrpc": "2.0",
                    "id": "out-6",
                    "method": "elicitation/create",
                    "params": {"_meta": {"progressToken": "tok"}}
                }),
                RequestOptions::session("s1")
                    .with_timeout(Duration::from_millis(150))
                    .with_reset_timeout_on_progress(true)
                    .with_progress(Arc::new(move |params| {
                        assert_eq!(params.progress_token.to_string(), "tok");
                        seen.fetch_add(1, Ordering::AcqRel);
                    })),
            )
            .await
    });

    transport.wait_for_sends(1).await;
    let session = Session::new("s1");

    // Two progress ticks, each inside the window, pushing the deadline out
    for _ in 0..2 {
        tokio::time::sleep(Duration::from_millis(90)).await;
        transport.deliver(
            json!({
                "jsonrpc": "2.0",
                "method": "notifications/progress",
                "params": {"progressToken": "tok", "progress": 0.5}
            }),
            Some(session.clone()),
        );
    }

    // 180ms elapsed: past the original timeout, kept alive by the resets
    tokio::time::sleep(Duration::from_millis(50)).await;
    transport.deliver(
        json!({"jsonrpc": "2.0", "id": "out-6", "result": {}}),
        Some(session),
    );

    let response = waiter.await.unwrap().unwrap().unwrap();
    assert!(response.is_success());
    assert_eq!(progress_seen.load(Ordering::Acquire), 2);
}

#[tokio::test]
async fn duplicate_handler_registration_fails() {
    let engine = ProtocolEngine::new(EngineConfig::default());
    engine.add_feature(&EchoFeature).unwrap();
    let err = engine.add_feature(&EchoFeature).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Configuration);
}

#[tokio::test]
async fn close_rejects_all_pending_requests() {
    let (engine, transport, connection) = engine_with_transport().await;

    let engine2 = engine.clone();
    let conn2 = connection.clone();
    let waiter = tokio::spawn(async move {
        engine2
            .send(
                &conn2,
                json!({"jsonrpc": "2.0", "id": "out-7", "method": "elicitation/create"}),
                RequestOptions::session("s1"),
            )
            .await
    });

    transport.wait_for_sends(1).await;
    engine.close().await;

    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConnectionClosed);
    assert_eq!(engine.pending_count(), 0);
}

#[tokio::test]
async fn uncorrelated_response_is_dropped() {
    let (engine, transport, _) = engine_with_transport().await;

    transport.deliver(
        json!({"jsonrpc": "2.0", "id": "nobody", "result": {}}),
        Some(Session::new("s1")),
    );

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(transport.sent_now().is_empty());
    assert_eq!(engine.pending_count(), 0);
}

#[tokio::test]
async fn notification_handlers_run_but_never_reply() {
    let (engine, transport, _) = engine_with_transport().await;
    let seen = Arc::new(AtomicUsize::new(0));

    struct NoteFeature {
        seen: Arc<AtomicUsize>,
    }
    impl Feature for NoteFeature {
        fn name(&self) -> &str {
            "note"
        }
        fn initialize(&self, ctx: &FeatureContext<'_>) -> McpResult<()> {
            let seen = self.seen.clone();
            ctx.register_handler(
                "notifications/custom",
                Arc::new(FnHandler::new(move |_f, _m, _c, _i| {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::AcqRel);
                        Ok(Value::Null)
                    }
                })),
            )
        }
    }
    engine.add_feature(&NoteFeature { seen: seen.clone() }).unwrap();

    transport.deliver(
        json!({"jsonrpc": "2.0", "method": "notifications/custom", "params": {}}),
        Some(Session::new("s1")),
    );

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(seen.load(Ordering::Acquire), 1);
    assert!(transport.sent_now().is_empty());
}

#[tokio::test]
async fn strict_capabilities_gate_server_initiated_requests() {
    let (engine, transport, _) = {
        let engine =
            ProtocolEngine::new(EngineConfig::default().with_strict_capabilities(true));
        let transport = Arc::new(MockTransport::default());
        let connection = engine
            .connect(transport.clone() as Arc<dyn ServerTransport>)
            .await
            .unwrap();
        (engine, transport, connection)
    };

    // A handler that tries a sampling request against a session that never
    // negotiated the sampling capability
    struct SamplingFeature;
    impl Feature for SamplingFeature {
        fn name(&self) -> &str {
            "sampling-probe"
        }
        fn initialize(&self, ctx: &FeatureContext<'_>) -> McpResult<()> {
            ctx.register_handler(
                "test/probe",
                Arc::new(FnHandler::new(|facade, _m, _c, _i| async move {
                    let err = facade
                        .send(
                            json!({
                                "jsonrpc": "2.0",
                                "id": "probe",
                                "method": "sampling/createMessage"
                            }),
                            RequestOptions::default(),
                        )
                        .await
                        .unwrap_err();
                    assert_eq!(err.kind, ErrorKind::InvalidParams);
                    Ok(json!({"gated": true}))
                })),
            )
        }
    }
    engine.add_feature(&SamplingFeature).unwrap();

    transport.deliver(
        json!({"jsonrpc": "2.0", "id": 9, "method": "test/probe"}),
        Some(Session::new("s1")),
    );

    let sent = transport.wait_for_sends(1).await;
    assert_eq!(sent[0].0["result"]["gated"], true);
}

#[tokio::test]
async fn schema_validator_rejects_requests_before_dispatch() {
    struct DenyList;
    impl meshmcp_server::SchemaValidator for DenyList {
        fn validate(&self, message: &Value, schema: &Value) -> McpResult<()> {
            let denied = schema["denyMethods"]
                .as_array()
                .map(|methods| methods.iter().any(|m| m == &message["method"]))
                .unwrap_or(false);
            if denied {
                Err(McpError::invalid_params("method is denied by schema"))
            } else {
                Ok(())
            }
        }
    }

    let engine = ProtocolEngine::new(
        EngineConfig::default()
            .with_validation(Arc::new(DenyList), json!({"denyMethods": ["test/blocked"]})),
    );
    let transport = Arc::new(MockTransport::default());
    engine
        .connect(transport.clone() as Arc<dyn ServerTransport>)
        .await
        .unwrap();
    engine.add_feature(&EchoFeature).unwrap();

    transport.deliver(
        json!({"jsonrpc": "2.0", "id": 1, "method": "test/blocked"}),
        Some(Session::new("s1")),
    );

    let sent = transport.wait_for_sends(1).await;
    assert_eq!(sent[0].0["error"]["code"], -32602);

    // Permitted methods still dispatch
    transport.deliver(
        json!({"jsonrpc": "2.0", "id": 2, "method": "test/echo", "params": {}}),
        Some(Session::new("s1")),
    );
    let sent = transport.wait_for_sends(2).await;
    assert!(sent[1].0.get("result").is_some());
}
