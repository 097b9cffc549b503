//! WebSocket transport against a loopback relay.
//!
//! The relay is a plain `tokio-tungstenite` server that acknowledges the
//! handshake, records every frame it receives, and pushes or closes on
//! command.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use walletlink::{
    Aes256GcmCodec, ClientMetadata, Codec, ConnectionMultiplexer, InMemorySessionRepository,
    LinkNotice, MultiplexerOptions, RelayUrl, SessionSecret, WebSocketConnector,
};

#[derive(Debug)]
enum Command {
    Push(String),
    Close,
}

struct LoopbackRelay {
    url: RelayUrl,
    received: mpsc::UnboundedReceiver<String>,
    commands: mpsc::UnboundedSender<Command>,
}

fn ack_for(frame: &Value) -> Option<Value> {
    let ack = match frame["type"].as_str()? {
        "HostSession" => "OK",
        "IsLinked" => "IsLinkedOK",
        "GetSessionConfig" => "GetSessionConfigOK",
        "PublishEvent" => "PublishEventOK",
        _ => return None,
    };
    Some(json!({"type": ack, "id": frame["id"], "sessionId": frame["sessionId"]}))
}

async fn start_relay() -> LoopbackRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = RelayUrl::from(format!("ws://{}/rpc", listener.local_addr().unwrap()));
    let (received_tx, received) = mpsc::unbounded_channel();
    let (commands, mut command_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        loop {
            tokio::select! {
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = received_tx.send(text.clone());
                        if let Some(ack) = serde_json::from_str::<Value>(&text).ok().as_ref().and_then(ack_for) {
                            ws.send(Message::Text(ack.to_string())).await.unwrap();
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
                cmd = command_rx.recv() => match cmd {
                    Some(Command::Push(text)) => ws.send(Message::Text(text)).await.unwrap(),
                    Some(Command::Close) | None => {
                        let _ = ws.close(None).await;
                        break;
                    }
                },
            }
        }
    });

    LoopbackRelay {
        url,
        received,
        commands,
    }
}

fn multiplexer(heartbeat: Duration) -> ConnectionMultiplexer {
    ConnectionMultiplexer::new(
        Arc::new(WebSocketConnector::new().with_heartbeat_interval(heartbeat)),
        Arc::new(InMemorySessionRepository::new()),
        MultiplexerOptions::default(),
    )
}

async fn link(mux: &ConnectionMultiplexer, relay: &LoopbackRelay) {
    tokio::time::timeout(
        Duration::from_secs(5),
        mux.link("A", SessionSecret::new("abc"), None, &relay.url, "u1", ClientMetadata::new()),
    )
    .await
    .expect("link timed out")
    .unwrap();
}

#[tokio::test]
async fn test_handshake_over_websocket() {
    let mut relay = start_relay().await;
    let mux = multiplexer(Duration::ZERO);
    link(&mux, &relay).await;

    let mut types = Vec::new();
    for _ in 0..4 {
        let frame: Value = serde_json::from_str(&relay.received.recv().await.unwrap()).unwrap();
        types.push(frame["type"].as_str().unwrap().to_string());
    }
    assert_eq!(types, ["HostSession", "IsLinked", "GetSessionConfig", "PublishEvent"]);
    assert_eq!(mux.connection_count(), 1);
}

#[tokio::test]
async fn test_heartbeats_are_sent() {
    let mut relay = start_relay().await;
    let mux = multiplexer(Duration::from_millis(50));
    link(&mux, &relay).await;

    let heartbeat = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(frame) = relay.received.recv().await {
            if frame == "h" {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(heartbeat);
}

#[tokio::test]
async fn test_pushed_event_is_delivered() {
    let relay = start_relay().await;
    let mux = multiplexer(Duration::ZERO);
    let mut requests = mux.subscribe_requests();
    link(&mux, &relay).await;

    let payload = json!({
        "type": "WEB3_REQUEST",
        "id": "r1",
        "request": {"method": "signEthereumMessage", "params": {"message": "0x00", "address": "0xabc", "addPrefix": true}},
        "origin": "https://dapp.test"
    });
    let data = Aes256GcmCodec::new()
        .encrypt(payload.to_string().as_bytes(), &SessionSecret::new("abc"))
        .unwrap();
    // Heartbeats from the relay are ignored.
    relay.commands.send(Command::Push("h".into())).unwrap();
    relay
        .commands
        .send(Command::Push(
            json!({"type": "Event", "sessionId": "A", "eventId": "e1", "event": "Web3Request", "data": data})
                .to_string(),
        ))
        .unwrap();

    let request = tokio::time::timeout(Duration::from_secs(2), requests.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.id.event_id, "e1");
    assert_eq!(request.id.url, relay.url);
    assert_eq!(request.decrypted_payload, payload);
}

#[tokio::test]
async fn test_server_close_reports_transport_closed() {
    let relay = start_relay().await;
    let mux = multiplexer(Duration::ZERO);
    let mut notices = mux.subscribe_notices();
    link(&mux, &relay).await;

    relay.commands.send(Command::Close).unwrap();
    let notice = tokio::time::timeout(Duration::from_secs(2), notices.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notice, LinkNotice::TransportClosed { url: relay.url.clone() });

    let request_id = walletlink::HostRequestId::new("e1", "A", relay.url.clone());
    assert!(mux.approve(&request_id, json!(null)).is_err());
}
