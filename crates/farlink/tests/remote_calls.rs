//! End-to-end calls over an in-memory pair: happy paths, path handling,
//! and the provider's policy checks.

use farlink::transports::MemoryEndpoint;
use farlink::{
    Arg, ConsumerConfig, Endpoint, ErrorKind, ErrorVerbosity, Exposed, Incoming, Multiplexer,
    ProviderConfig, RemoteObject,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Endpoint wrapper that records every message posted through it.
struct RecordingEndpoint {
    inner: MemoryEndpoint,
    posts: Mutex<Vec<Value>>,
}

impl RecordingEndpoint {
    fn new(inner: MemoryEndpoint) -> Self {
        RecordingEndpoint {
            inner,
            posts: Mutex::new(Vec::new()),
        }
    }

    fn post_count(&self) -> usize {
        self.posts.lock().len()
    }
}

impl Endpoint for RecordingEndpoint {
    fn post(&self, message: Value) {
        self.posts.lock().push(message.clone());
        self.inner.post(message);
    }

    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Value> {
        self.inner.subscribe()
    }
}

fn math_root() -> Exposed {
    Exposed::object([
        (
            "add",
            Exposed::function(|args: Vec<Incoming>| async move {
                let a: i64 = args[0].deserialize()?;
                let b: i64 = args[1].deserialize()?;
                Ok(Exposed::value(a + b))
            }),
        ),
        (
            "math",
            Exposed::object([(
                "pow",
                Exposed::function(|args: Vec<Incoming>| async move {
                    let base: i64 = args[0].deserialize()?;
                    let exp: u32 = args[1].deserialize()?;
                    Ok(Exposed::value(base.pow(exp)))
                }),
            )]),
        ),
        ("config", Exposed::value(json!({ "retries": 3, "hosts": ["a", "b"] }))),
    ])
}

/// Provider on one end, consumer on the other, with recording taps on both
/// raw endpoints.
fn session_with_recorders(
    root: Exposed,
    provider_config: ProviderConfig,
) -> (
    RemoteObject,
    Arc<RecordingEndpoint>,
    Arc<RecordingEndpoint>,
    farlink::ProviderHandle,
) {
    let (host_end, client_end) = MemoryEndpoint::pair();
    let host_end = Arc::new(RecordingEndpoint::new(host_end));
    let client_end = Arc::new(RecordingEndpoint::new(client_end));

    let host = Multiplexer::new(host_end.clone() as Arc<dyn Endpoint>);
    let provider = host.provide(root, provider_config);

    let client = Multiplexer::new(client_end.clone() as Arc<dyn Endpoint>);
    let remote = client.consume(ConsumerConfig::default().timeout(Duration::from_secs(5)));
    (remote, host_end, client_end, provider)
}

fn session(root: Exposed, provider_config: ProviderConfig) -> (RemoteObject, farlink::ProviderHandle) {
    let (remote, _h, _c, provider) = session_with_recorders(root, provider_config);
    (remote, provider)
}

#[tokio::test]
async fn simple_call_returns_the_sum() {
    init_logs();
    let (remote, _host_rec, client_rec, _provider) =
        session_with_recorders(math_root(), ProviderConfig::default());

    let sum: i64 = remote
        .get("add")
        .unwrap()
        .call(vec![Arg::value(2), Arg::value(3)])
        .await
        .unwrap()
        .deserialize()
        .unwrap();

    assert_eq!(sum, 5);
    // Exactly one outbound message from the consumer side: the request.
    assert_eq!(client_rec.post_count(), 1);
}

#[tokio::test]
async fn property_access_sends_nothing_until_a_terminal_operation() {
    init_logs();
    let (remote, host_rec, client_rec, _provider) =
        session_with_recorders(math_root(), ProviderConfig::default());

    let pow = remote.get("math").unwrap().get("pow").unwrap();
    let again = remote.at("math/pow").unwrap();
    assert_eq!(pow.path(), "math/pow");
    assert_eq!(again.path(), "math/pow");
    assert_eq!(client_rec.post_count(), 0, "proxy walking is local");
    assert_eq!(host_rec.post_count(), 0);

    let result: i64 = pow
        .call(vec![Arg::value(2), Arg::value(10)])
        .await
        .unwrap()
        .deserialize()
        .unwrap();
    assert_eq!(result, 1024);
    assert_eq!(client_rec.post_count(), 1, "one message for the invocation");
    assert_eq!(host_rec.post_count(), 1, "one message for the response");
}

#[tokio::test]
async fn clonable_leaves_fetch_by_value() {
    init_logs();
    let (remote, _provider) = session(math_root(), ProviderConfig::default());

    let retries: i64 = remote.at("config/retries").unwrap().fetch_as().await.unwrap();
    assert_eq!(retries, 3);

    // Array elements resolve by decimal index.
    let host: String = remote.at("config/hosts/1").unwrap().fetch_as().await.unwrap();
    assert_eq!(host, "b");

    // Fetching the subtree returns it whole, structurally equal.
    let config: Value = remote.get("config").unwrap().fetch_as().await.unwrap();
    assert_eq!(config, json!({ "retries": 3, "hosts": ["a", "b"] }));
}

#[tokio::test]
async fn forbidden_names_are_rejected_locally_and_do_not_disturb_the_session() {
    init_logs();
    let (remote, _host_rec, client_rec, _provider) =
        session_with_recorders(math_root(), ProviderConfig::default());

    for name in ["__proto__", "constructor"] {
        let err = remote.get(name).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ForbiddenProperty);
    }
    assert_eq!(client_rec.post_count(), 0, "rejection is local");

    // The session keeps working afterwards.
    let sum: i64 = remote
        .get("add")
        .unwrap()
        .call(vec![Arg::value(1), Arg::value(1)])
        .await
        .unwrap()
        .deserialize()
        .unwrap();
    assert_eq!(sum, 2);
}

#[tokio::test]
async fn write_denied_by_default_and_state_is_unchanged() {
    init_logs();
    let (remote, _provider) = session(
        Exposed::object([("x", Exposed::value(1))]),
        ProviderConfig::default(),
    );

    let err = remote.get("x").unwrap().set(Arg::value(2)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteDenied);

    let x: i64 = remote.get("x").unwrap().fetch_as().await.unwrap();
    assert_eq!(x, 1, "provider state must be unchanged");
}

#[tokio::test]
async fn allow_write_permits_assignment() {
    init_logs();
    let (remote, _provider) = session(
        Exposed::object([("x", Exposed::value(1))]),
        ProviderConfig::default().allow_write(true),
    );

    remote.get("x").unwrap().set(Arg::value(42)).await.unwrap();
    let x: i64 = remote.get("x").unwrap().fetch_as().await.unwrap();
    assert_eq!(x, 42);

    // New properties can be introduced too.
    remote.get("y").unwrap().set(Arg::value("fresh")).await.unwrap();
    let y: String = remote.get("y").unwrap().fetch_as().await.unwrap();
    assert_eq!(y, "fresh");
}

#[tokio::test]
async fn the_root_is_never_settable() {
    init_logs();
    let (remote, _provider) = session(
        Exposed::object([("x", Exposed::value(1))]),
        ProviderConfig::default().allow_write(true),
    );

    let err = remote.set(Arg::value(json!({}))).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RootNotSettable);
}

#[tokio::test]
async fn assignment_into_a_scalar_is_a_readonly_violation() {
    init_logs();
    let (remote, _provider) = session(
        Exposed::object([("num", Exposed::value(5))]),
        ProviderConfig::default().allow_write(true),
    );

    let err = remote
        .at("num/deep")
        .unwrap()
        .set(Arg::value(1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadonlyViolation);
}

#[tokio::test]
async fn missing_properties_fail_resolution() {
    init_logs();
    let (remote, _provider) = session(math_root(), ProviderConfig::default());

    let err = remote.at("math/nope").unwrap().fetch().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResolutionFailed);
}

#[tokio::test]
async fn calling_a_non_function_fails() {
    init_logs();
    let (remote, _provider) = session(math_root(), ProviderConfig::default());

    let err = remote
        .get("config")
        .unwrap()
        .call(vec![])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAFunction);
}

#[tokio::test]
async fn host_failures_surface_as_user_thrown() {
    init_logs();
    let (remote, _provider) = session(
        Exposed::object([(
            "fail",
            Exposed::function(|_args| async { Err("no such user".into()) }),
        )]),
        ProviderConfig::default(),
    );

    let err = remote.get("fail").unwrap().call(vec![]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UserThrown);
    assert!(err.to_string().contains("no such user"));
}

#[tokio::test]
async fn one_failed_request_does_not_disturb_the_others() {
    init_logs();
    let (remote, _provider) = session(math_root(), ProviderConfig::default());

    let bad = remote.at("math/nope").unwrap();
    let good = remote.at("math/pow").unwrap();
    let (bad_result, good_result) = tokio::join!(
        bad.fetch(),
        good.call(vec![Arg::value(3), Arg::value(2)])
    );
    assert!(bad_result.is_err());
    let squared: i64 = good_result.unwrap().deserialize().unwrap();
    assert_eq!(squared, 9);
}

// ── Raw wire behaviour (bypassing the consumer's local checks) ────────────────

/// Post a hand-built request on the root channel and await the response.
async fn raw_exchange(provider_root: Exposed, request: Value) -> Value {
    let (host_end, client_end) = MemoryEndpoint::pair();
    let host = Multiplexer::new(Arc::new(host_end));
    let _provider = host.provide(provider_root, ProviderConfig::default());

    let client = Multiplexer::new(Arc::new(client_end));
    let root_channel = client.open_channel(farlink::ROOT_CHANNEL);
    let mut rx = root_channel.subscribe();
    root_channel.post(request);

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let msg = rx.recv().await.expect("channel open");
            if msg.get("type").and_then(Value::as_str) == Some("response") {
                return msg;
            }
        }
    })
    .await
    .expect("timed out waiting for a response")
}

fn raw_request(operation: &str, path: &str, args: Value) -> Value {
    json!({
        "requestID": "raw-1",
        "consumerID": "raw-consumer",
        "realmID": "some-other-realm",
        "operationType": operation,
        "propertyPath": path,
        "args": args,
    })
}

#[tokio::test]
async fn provider_rejects_forbidden_segments_on_the_wire() {
    init_logs();
    for segment in ["__proto__", "prototype", "constructor", "then", "catch", "finally"] {
        let response = raw_exchange(math_root(), raw_request("await", segment, json!([]))).await;
        assert_eq!(response["resultType"], json!("error"), "{segment}");
        assert_eq!(response["result"]["code"], json!("E002"), "{segment}");
    }
}

#[tokio::test]
async fn provider_rejects_unknown_operations() {
    init_logs();
    let response = raw_exchange(math_root(), raw_request("subscribe", "add", json!([]))).await;
    assert_eq!(response["resultType"], json!("error"));
    assert_eq!(response["result"]["code"], json!("E007"));
}

#[tokio::test]
async fn provider_rejects_non_sequence_args() {
    init_logs();
    let response =
        raw_exchange(math_root(), raw_request("call", "add", json!("not-a-list"))).await;
    assert_eq!(response["resultType"], json!("error"));
    assert_eq!(response["result"]["code"], json!("E001"));
}

#[tokio::test]
async fn provider_echoes_the_request_id_it_answers() {
    init_logs();
    let response = raw_exchange(math_root(), raw_request("await", "config", json!([]))).await;
    assert_eq!(response["requestID"], json!("raw-1"));
    assert_eq!(response["resultType"], json!("result"));
}

#[tokio::test]
async fn codes_verbosity_hides_messages_behind_short_codes() {
    init_logs();
    let (remote, _provider) = session(
        Exposed::object([("x", Exposed::value(1))]),
        ProviderConfig::default().verbosity(ErrorVerbosity::Codes),
    );

    let err = remote.get("x").unwrap().set(Arg::value(2)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteDenied);
    assert_eq!(err.to_string(), "E005");
}
