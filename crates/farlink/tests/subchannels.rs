//! Sub-channel behaviour: by-reference arguments, nested result proxies,
//! constructors, relays, and lifetime coupling between proxies and their
//! counterpart sub-providers.

use farlink::transports::MemoryEndpoint;
use farlink::{
    Arg, ConsumerConfig, Endpoint, ErrorKind, Exposed, Incoming, Multiplexer, ProviderConfig,
    RemoteObject,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Endpoint wrapper that records the envelopes crossing it.
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

    fn channel_ids(&self) -> BTreeSet<String> {
        self.posts
            .lock()
            .iter()
            .filter_map(|m| m.get("channelID").and_then(Value::as_str).map(String::from))
            .collect()
    }

    fn releases(&self) -> Vec<String> {
        self.posts
            .lock()
            .iter()
            .filter(|m| m["data"].get("type").and_then(Value::as_str) == Some("release"))
            .filter_map(|m| m.get("channelID").and_then(Value::as_str).map(String::from))
            .collect()
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

struct Session {
    remote: RemoteObject,
    host_rec: Arc<RecordingEndpoint>,
    client_rec: Arc<RecordingEndpoint>,
    _provider: farlink::ProviderHandle,
}

fn session(root: Exposed) -> Session {
    let (host_end, client_end) = MemoryEndpoint::pair();
    let host_rec = Arc::new(RecordingEndpoint::new(host_end));
    let client_rec = Arc::new(RecordingEndpoint::new(client_end));

    let host = Multiplexer::new(host_rec.clone() as Arc<dyn Endpoint>);
    let provider = host.provide(root, ProviderConfig::default().allow_write(true));

    let client = Multiplexer::new(client_rec.clone() as Arc<dyn Endpoint>);
    let remote = client.consume(ConsumerConfig::default().timeout(Duration::from_secs(5)));
    Session {
        remote,
        host_rec,
        client_rec,
        _provider: provider,
    }
}

fn wire_channels(s: &Session) -> BTreeSet<String> {
    let mut ids = s.host_rec.channel_ids();
    ids.extend(s.client_rec.channel_ids());
    ids
}

#[tokio::test]
async fn clonable_arguments_open_no_extra_channels() {
    init_logs();
    let s = session(Exposed::object([(
        "concat",
        Exposed::function(|args: Vec<Incoming>| async move {
            let a: String = args[0].deserialize()?;
            let b: String = args[1].deserialize()?;
            Ok(Exposed::value(format!("{a}{b}")))
        }),
    )]));

    let joined: String = s
        .remote
        .get("concat")
        .unwrap()
        .call(vec![Arg::value("far"), Arg::value("link")])
        .await
        .unwrap()
        .deserialize()
        .unwrap();
    assert_eq!(joined, "farlink");
    assert_eq!(
        wire_channels(&s),
        BTreeSet::from(["root".to_string()]),
        "all-clonable traffic stays on the root channel"
    );
}

#[tokio::test]
async fn function_arguments_are_invoked_back_on_the_calling_side() {
    init_logs();
    let s = session(Exposed::object([(
        "echo",
        Exposed::function(|args: Vec<Incoming>| async move {
            let f = args
                .into_iter()
                .next()
                .and_then(Incoming::into_remote)
                .ok_or("expected a callback")?;
            let result = f.call(vec![]).await.map_err(|e| e.to_string())?;
            Ok(match result {
                Incoming::Value(v) => Exposed::Value(v),
                Incoming::Remote(r) => Exposed::Remote(r),
            })
        }),
    )]));

    let answer: i64 = s
        .remote
        .get("echo")
        .unwrap()
        .call(vec![Arg::function(|_args| async { Ok(Exposed::value(42)) })])
        .await
        .unwrap()
        .deserialize()
        .unwrap();
    assert_eq!(answer, 42);

    // Exactly one channel besides the root for the duration of the call.
    let channels = wire_channels(&s);
    assert_eq!(channels.len(), 2, "root plus one sub-channel: {channels:?}");
}

#[tokio::test]
async fn non_clonable_results_come_back_as_live_proxies() {
    init_logs();
    let s = session(Exposed::object([(
        "make_counter",
        Exposed::function(|_args| async move {
            let count = Arc::new(AtomicI64::new(0));
            Ok(Exposed::object([
                (
                    "increment",
                    Exposed::function(move |_args| {
                        let count = Arc::clone(&count);
                        async move { Ok(Exposed::value(count.fetch_add(1, Ordering::SeqCst) + 1)) }
                    }),
                ),
                ("label", Exposed::value("counter")),
            ]))
        }),
    )]));

    let counter = s
        .remote
        .get("make_counter")
        .unwrap()
        .call(vec![])
        .await
        .unwrap()
        .into_remote()
        .expect("non-clonable results arrive by reference");

    let inc = counter.get("increment").unwrap();
    let first: i64 = inc.call(vec![]).await.unwrap().deserialize().unwrap();
    let second: i64 = inc.call(vec![]).await.unwrap().deserialize().unwrap();
    assert_eq!((first, second), (1, 2), "state lives on the providing side");

    // Clonable leaves of the referenced object still fetch by value.
    let label: String = counter.get("label").unwrap().fetch_as().await.unwrap();
    assert_eq!(label, "counter");
}

#[tokio::test]
async fn dropping_a_result_proxy_releases_its_sub_provider() {
    init_logs();
    let s = session(Exposed::object([(
        "make",
        Exposed::function(|_args| async {
            Ok(Exposed::object([(
                "ping",
                Exposed::function(|_args| async { Ok(Exposed::value("pong")) }),
            )]))
        }),
    )]));

    let made = s
        .remote
        .get("make")
        .unwrap()
        .call(vec![])
        .await
        .unwrap()
        .into_remote()
        .unwrap();
    let sub_channels: Vec<String> = wire_channels(&s)
        .into_iter()
        .filter(|id| id != "root")
        .collect();
    assert_eq!(sub_channels.len(), 1);
    assert!(s.client_rec.releases().is_empty());
    assert_eq!(s._provider.subprovider_count(), 1);

    drop(made);
    // The release notice goes out on the drop turn; give the loops a chance
    // to observe it.
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(
        s.client_rec.releases(),
        sub_channels,
        "dropping the proxy posts a release on its sub-channel"
    );
    assert_eq!(
        s._provider.subprovider_count(),
        0,
        "a released sub-provider is reclaimed, not retained by its owner"
    );

    // The sub-provider is gone: raw traffic on that channel gets no answer.
    let client = {
        // Reuse the recorded sub-channel id from a second session-side mux
        // sharing the same raw endpoint.
        Multiplexer::new(s.client_rec.clone() as Arc<dyn Endpoint>)
    };
    let chan = client.open_channel(&sub_channels[0]);
    let mut rx = chan.subscribe();
    chan.post(json!({
        "requestID": "after-release",
        "consumerID": "c",
        "realmID": "other-realm",
        "operationType": "await",
        "propertyPath": "",
        "args": [],
    }));
    let outcome = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
    assert!(outcome.is_err(), "a released sub-provider must not answer");
}

#[tokio::test]
async fn argument_sub_providers_are_reclaimed_after_release() {
    init_logs();
    let s = session(Exposed::object([(
        "ignore",
        Exposed::function(|_args| async { Ok(Exposed::null()) }),
    )]));

    // Each call ships its callback over a fresh sub-channel; the callee
    // drops the materialised proxy when it returns, releasing the
    // sub-provider. A long-lived consumer must not accumulate them.
    for _ in 0..5 {
        s.remote
            .get("ignore")
            .unwrap()
            .call(vec![Arg::function(|_args| async { Ok(Exposed::null()) })])
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(
        s.remote.subprovider_count(),
        0,
        "released argument sub-providers must be reclaimed"
    );
}

#[tokio::test]
async fn constructors_build_remote_instances() {
    init_logs();
    let s = session(Exposed::object([
        (
            "Point",
            Exposed::constructor(|args: Vec<Incoming>| async move {
                let x: f64 = args[0].deserialize()?;
                let y: f64 = args[1].deserialize()?;
                Ok(Exposed::object([
                    ("x", Exposed::value(x)),
                    ("y", Exposed::value(y)),
                    (
                        "norm",
                        Exposed::function(move |_args| async move {
                            Ok(Exposed::value((x * x + y * y).sqrt()))
                        }),
                    ),
                ]))
            }),
        ),
        ("unit", Exposed::value(1.0)),
    ]));

    let point = s
        .remote
        .get("Point")
        .unwrap()
        .construct(vec![Arg::value(3.0), Arg::value(4.0)])
        .await
        .unwrap()
        .into_remote()
        .unwrap();

    let norm: f64 = point.get("norm").unwrap().call(vec![]).await.unwrap().deserialize().unwrap();
    assert!((norm - 5.0).abs() < 1e-9);

    // Calling a constructor as a plain function is refused.
    let err = s.remote.get("Point").unwrap().call(vec![]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAFunction);

    // Constructing a directly-resolved non-constructor value is refused.
    let err = s.remote.get("unit").unwrap().construct(vec![]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAFunction);

    // Walking through a constructor node to a child fails during
    // resolution, before any dispatch.
    let err = s
        .remote
        .get("Point")
        .unwrap()
        .get("x")
        .unwrap()
        .construct(vec![])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResolutionFailed);
}

#[tokio::test]
async fn handlers_assigned_by_reference_are_called_through_a_relay() {
    init_logs();
    let s = session(Exposed::object([("slot", Exposed::value(Value::Null))]));

    // Assign a callback by reference, then invoke it through the provider.
    s.remote
        .get("on_ping")
        .unwrap()
        .set(Arg::function(|args: Vec<Incoming>| async move {
            let n: i64 = args[0].deserialize()?;
            Ok(Exposed::value(n * 10))
        }))
        .await
        .unwrap();

    let out: i64 = s
        .remote
        .get("on_ping")
        .unwrap()
        .call(vec![Arg::value(7)])
        .await
        .unwrap()
        .deserialize()
        .unwrap();
    assert_eq!(out, 70, "provider relays the call back to the assigner");
}

#[tokio::test]
async fn remotes_passed_back_as_arguments_keep_working() {
    init_logs();
    let s = session(Exposed::object([
        (
            "make_adder",
            Exposed::function(|args: Vec<Incoming>| async move {
                let base: i64 = args[0].deserialize()?;
                Ok(Exposed::function(move |args: Vec<Incoming>| async move {
                    let n: i64 = args[0].deserialize()?;
                    Ok(Exposed::value(base + n))
                }))
            }),
        ),
        (
            "apply",
            Exposed::function(|args: Vec<Incoming>| async move {
                let f = args[0].clone().into_remote().ok_or("expected a function")?;
                let n = args[1].clone();
                let out = f.call(vec![n.into()]).await.map_err(|e| e.to_string())?;
                Ok(match out {
                    Incoming::Value(v) => Exposed::Value(v),
                    Incoming::Remote(r) => Exposed::Remote(r),
                })
            }),
        ),
    ]));

    // Obtain a remote function, then hand it back to the provider.
    let add_five = s
        .remote
        .get("make_adder")
        .unwrap()
        .call(vec![Arg::value(5)])
        .await
        .unwrap()
        .into_remote()
        .unwrap();

    let out: i64 = s
        .remote
        .get("apply")
        .unwrap()
        .call(vec![Arg::from(add_five), Arg::value(3)])
        .await
        .unwrap()
        .deserialize()
        .unwrap();
    assert_eq!(out, 8);
}

#[tokio::test]
async fn fetching_a_function_yields_a_callable_proxy() {
    init_logs();
    let s = session(Exposed::object([(
        "double",
        Exposed::function(|args: Vec<Incoming>| async move {
            let n: i64 = args[0].deserialize()?;
            Ok(Exposed::value(n * 2))
        }),
    )]));

    let fetched = s
        .remote
        .get("double")
        .unwrap()
        .fetch()
        .await
        .unwrap()
        .into_remote()
        .expect("functions fetch by reference");
    let out: i64 = fetched.call(vec![Arg::value(21)]).await.unwrap().deserialize().unwrap();
    assert_eq!(out, 42);
}
