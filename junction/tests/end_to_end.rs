//! End-to-end scenarios over a loopback mesh of `Hub`s.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use junction::dispatcher::HandlerError;
use junction::hub::Hub;
use junction::{JunctionError, Value};

async fn mesh_pair() -> (Hub, Hub) {
    let a = Hub::bind("127.0.0.1:0").await.unwrap();
    let b = Hub::bind("127.0.0.1:0").await.unwrap();
    let b_addr = format!("{}:{}", b.ident().host, b.ident().port);
    a.connect(b_addr, Default::default());
    // Wait for the handshake to settle on both sides before registering
    // further subscriptions that depend on the mesh already being up.
    compio::time::sleep(Duration::from_millis(200)).await;
    (a, b)
}

fn svc(name: &str) -> Value {
    Value::from(name)
}

#[compio::test]
async fn publish_fan_out_delivers_in_order() {
    let (a, b) = mesh_pair().await;

    let received: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();
    a.accept_publish(svc("s"), 0, 0, "m", move |args, _kwargs| {
        received_clone.lock().unwrap().push(args[0].as_i64().unwrap());
    })
    .await
    .unwrap();
    compio::time::sleep(Duration::from_millis(200)).await;

    for i in 1..=4 {
        b.publish(svc("s"), 0, "m", vec![Value::from(i)], Vec::new(), false).await;
    }
    compio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(*received.lock().unwrap(), vec![1, 2, 3, 4]);
}

#[compio::test]
async fn service_mismatch_delivers_nothing() {
    let (a, b) = mesh_pair().await;

    let hit = Arc::new(AtomicUsize::new(0));
    let hit_clone = hit.clone();
    a.accept_publish(svc("s1"), 0, 0, "m", move |_args, _kwargs| {
        hit_clone.fetch_add(1, Ordering::SeqCst);
    })
    .await
    .unwrap();
    compio::time::sleep(Duration::from_millis(200)).await;

    let delivered = b.publish(svc("s2"), 0, "m", vec![Value::from(1)], Vec::new(), false).await;
    compio::time::sleep(Duration::from_millis(100)).await;

    assert!(!delivered);
    assert_eq!(hit.load(Ordering::SeqCst), 0);
}

#[compio::test]
async fn rpc_squared() {
    let (a, b) = mesh_pair().await;

    a.accept_rpc(svc("s"), 0, 0, "m", |mut args, _kwargs| {
        let x = args.pop().unwrap_or(Value::Nil).as_i64().unwrap_or(0);
        Ok(Value::from(x * x))
    })
    .await
    .unwrap();
    compio::time::sleep(Duration::from_millis(200)).await;

    let results = b
        .rpc(svc("s"), 0, "m", vec![Value::from(3)], Vec::new(), false, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_ref().unwrap().as_i64(), Some(9));
}

#[compio::test]
async fn singular_rpc_hits_exactly_one_handler() {
    let (a, b) = mesh_pair().await;

    let a_hits = Arc::new(AtomicUsize::new(0));
    let b_hits = Arc::new(AtomicUsize::new(0));
    let a_clone = a_hits.clone();
    a.accept_rpc(svc("s"), 0, 0, "m", move |_args, _kwargs| {
        a_clone.fetch_add(1, Ordering::SeqCst);
        Ok(Value::from("a"))
    })
    .await
    .unwrap();
    let b_clone = b_hits.clone();
    b.accept_rpc(svc("s"), 0, 0, "m", move |_args, _kwargs| {
        b_clone.fetch_add(1, Ordering::SeqCst);
        Ok(Value::from("b"))
    })
    .await
    .unwrap();
    compio::time::sleep(Duration::from_millis(200)).await;

    let results = b
        .rpc(svc("s"), 0, "m", Vec::new(), Vec::new(), true, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(a_hits.load(Ordering::SeqCst) + b_hits.load(Ordering::SeqCst), 1);
}

#[compio::test]
async fn handled_error_round_trips_code_and_args() {
    let (a, b) = mesh_pair().await;

    a.accept_rpc(svc("s"), 0, 0, "m", |_args, _kwargs| {
        Err(HandlerError::Handled {
            code: 3,
            args: vec![Value::from("gaah")],
        })
    })
    .await
    .unwrap();
    compio::time::sleep(Duration::from_millis(200)).await;

    let results = b
        .rpc(svc("s"), 0, "m", Vec::new(), Vec::new(), false, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    match results[0].as_ref().unwrap_err() {
        JunctionError::HandledError { code, peer_addr, args } => {
            assert_eq!(*code, 3);
            assert!(!peer_addr.is_empty());
            assert_eq!(args.len(), 1);
            assert_eq!(args[0].as_str(), Some("gaah"));
        }
        other => panic!("expected HandledError, got {other:?}"),
    }
}

// The "lost connection mid-chunk" scenario (spec scenario 6) needs to
// interrupt a stream between chunks, which the public `Hub` API has no
// handle for — `publish_chunks` sends open/chunks/end as one atomic call.
// That exact behavior (`dropped_peer_mid_stream_yields_lost_connection_sentinel`)
// is covered deterministically at the dispatcher level in `dispatcher.rs`'s
// own test module. This is the network-level companion: a chunked stream
// that completes normally is delivered in order end to end.
#[compio::test]
async fn chunked_publish_delivers_in_order_over_the_wire() {
    let (a, b) = mesh_pair().await;

    let items: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let items_clone = items.clone();
    a.accept_publish(svc("s"), 0, 0, "m", move |args, _kwargs| {
        items_clone.lock().unwrap().push(args[0].clone());
    })
    .await
    .unwrap();
    compio::time::sleep(Duration::from_millis(200)).await;

    let delivered = b.publish_chunks(svc("s"), 0, "m", Vec::new(), vec![Value::from(1), Value::from(2), Value::from(3)]).await;
    compio::time::sleep(Duration::from_millis(200)).await;

    assert!(delivered);
    let seen = items.lock().unwrap();
    assert_eq!(seen.iter().map(|v| v.as_i64().unwrap()).collect::<Vec<_>>(), vec![1, 2, 3]);
}
