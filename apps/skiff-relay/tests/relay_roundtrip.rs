use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use skiff_proto::{Envelope, EnvelopeKind, SessionId};
use skiff_relay::registry::{CollisionPolicy, Registry};
use skiff_relay::relay::RelayState;
use skiff_relay::server::{self, AppState};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestRelay {
    url: String,
    relay: RelayState,
    _shutdown: oneshot::Sender<()>,
}

async fn start_relay(policy: CollisionPolicy) -> TestRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let relay = RelayState::new(Arc::new(Registry::new(policy)), 64 * 1024);
    let state = AppState {
        relay: relay.clone(),
        metrics: None,
    };
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        server::serve(listener, state, async move {
            let _ = shutdown_rx.await;
        })
        .await
        .unwrap();
    });
    TestRelay {
        url: format!("ws://{addr}/"),
        relay,
        _shutdown: shutdown_tx,
    }
}

async fn connect(relay: &TestRelay) -> Client {
    let (stream, _) = connect_async(relay.url.as_str()).await.unwrap();
    stream
}

async fn send_text(client: &mut Client, text: impl Into<String>) {
    client.send(Message::text(text.into())).await.unwrap();
}

async fn register(relay: &TestRelay, id: &str) -> Client {
    let mut client = connect(relay).await;
    send_text(
        &mut client,
        Envelope::register(&SessionId::from(id)).to_text().unwrap(),
    )
    .await;
    wait_until(|| relay.relay.registry().lookup(&SessionId::from(id)).is_some()).await;
    client
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        sleep(Duration::from_millis(10)).await;
    }
}

async fn recv_envelope(client: &mut Client) -> Envelope {
    loop {
        let frame = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for envelope")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return Envelope::parse(text.as_str()).expect("relay sends valid envelopes");
        }
    }
}

async fn expect_nothing(client: &mut Client) {
    match timeout(Duration::from_millis(200), client.next()).await {
        Err(_) => {}
        Ok(frame) => panic!("unexpected frame: {frame:?}"),
    }
}

#[test_timeout::timeout]
async fn offer_candidates_and_answer_flow_between_two_endpoints() {
    let relay = start_relay(CollisionPolicy::Replace).await;
    let mut alice = register(&relay, "alice").await;
    let mut bob = register(&relay, "bob").await;

    let offer = json!({"type": "offer", "sdp": "v=0\r\ns=alice\r\n"});
    send_text(
        &mut alice,
        json!({"type": "offer", "payload": offer, "to": "bob"}).to_string(),
    )
    .await;

    let delivered = recv_envelope(&mut bob).await;
    assert_eq!(delivered.kind, EnvelopeKind::Offer);
    assert_eq!(delivered.payload, offer);
    assert_eq!(delivered.from, Some(SessionId::from("alice")));

    for candidate in ["c1", "c2"] {
        let envelope = Envelope::ice("alice".into(), json!({ "candidate": candidate }));
        send_text(&mut bob, envelope.to_text().unwrap()).await;
    }
    let answer = json!({"type": "answer", "sdp": "v=0\r\ns=bob\r\n"});
    send_text(
        &mut bob,
        Envelope::answer("alice".into(), answer.clone())
            .to_text()
            .unwrap(),
    )
    .await;

    let first = recv_envelope(&mut alice).await;
    let second = recv_envelope(&mut alice).await;
    let third = recv_envelope(&mut alice).await;
    assert_eq!(first.payload, json!({"candidate": "c1"}));
    assert_eq!(second.payload, json!({"candidate": "c2"}));
    assert_eq!(third.kind, EnvelopeKind::Answer);
    assert_eq!(third.payload, answer);
    assert!([first, second, third]
        .iter()
        .all(|envelope| envelope.from == Some(SessionId::from("bob"))));
}

#[test_timeout::timeout]
async fn unknown_recipient_and_garbage_leave_connection_usable() {
    let relay = start_relay(CollisionPolicy::Replace).await;
    let mut alice = register(&relay, "alice").await;
    let mut bob = register(&relay, "bob").await;

    send_text(
        &mut alice,
        Envelope::ice("carol".into(), json!({"candidate": "c"}))
            .to_text()
            .unwrap(),
    )
    .await;
    send_text(&mut alice, "this is not json").await;
    send_text(&mut alice, r#"{"type":"offer","payload":{"sdp":"x"}}"#).await;
    alice
        .send(Message::binary(vec![0xff_u8, 0x00, 0x13]))
        .await
        .unwrap();
    expect_nothing(&mut alice).await;

    send_text(
        &mut alice,
        Envelope::ice("bob".into(), json!({"candidate": "still-alive"}))
            .to_text()
            .unwrap(),
    )
    .await;
    let delivered = recv_envelope(&mut bob).await;
    assert_eq!(delivered.payload, json!({"candidate": "still-alive"}));
}

#[test_timeout::timeout]
async fn reregistration_moves_routing_to_latest_connection() {
    let relay = start_relay(CollisionPolicy::Replace).await;
    let mut alice = register(&relay, "alice").await;
    let mut first_bob = register(&relay, "bob").await;
    let first_id = relay.relay.registry().lookup(&"bob".into()).unwrap().id();

    let mut second_bob = connect(&relay).await;
    send_text(
        &mut second_bob,
        Envelope::register(&"bob".into()).to_text().unwrap(),
    )
    .await;
    wait_until(|| {
        relay
            .relay
            .registry()
            .lookup(&"bob".into())
            .map(|handle| handle.id() != first_id)
            .unwrap_or(false)
    })
    .await;

    send_text(
        &mut alice,
        Envelope::ice("bob".into(), json!({"candidate": "c"}))
            .to_text()
            .unwrap(),
    )
    .await;
    assert_eq!(
        recv_envelope(&mut second_bob).await.payload,
        json!({"candidate": "c"})
    );
    expect_nothing(&mut first_bob).await;
}

#[test_timeout::timeout]
async fn reject_policy_keeps_first_owner() {
    let relay = start_relay(CollisionPolicy::Reject).await;
    let mut alice = register(&relay, "alice").await;
    let mut first_bob = register(&relay, "bob").await;
    let first_id = relay.relay.registry().lookup(&"bob".into()).unwrap().id();

    let mut impostor = connect(&relay).await;
    send_text(
        &mut impostor,
        Envelope::register(&"bob".into()).to_text().unwrap(),
    )
    .await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        relay.relay.registry().lookup(&"bob".into()).unwrap().id(),
        first_id
    );

    send_text(
        &mut alice,
        Envelope::ice("bob".into(), json!({"candidate": "c"}))
            .to_text()
            .unwrap(),
    )
    .await;
    assert_eq!(recv_envelope(&mut first_bob).await.kind, EnvelopeKind::Ice);
    expect_nothing(&mut impostor).await;
}

#[test_timeout::timeout]
async fn disconnect_unregisters_session_id() {
    let relay = start_relay(CollisionPolicy::Replace).await;
    let _alice = register(&relay, "alice").await;
    let mut bob = register(&relay, "bob").await;
    assert_eq!(relay.relay.registry().len(), 2);

    bob.close(None).await.unwrap();
    wait_until(|| relay.relay.registry().lookup(&"bob".into()).is_none()).await;
    assert_eq!(relay.relay.registry().len(), 1);
}
