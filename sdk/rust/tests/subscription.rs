//! Subscription tests against a local `graphql-transport-ws` server.

use futures_util::{SinkExt, StreamExt};
use gqlconnect_sdk::{
    create_connector, ConnectorConfig, ErrorCode, GraphQLClient, OriginSettings, ReconnectPolicy,
    SubscriptionClient, SubscriptionEvent, SubscriptionHandlers,
};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type ServerSocket = WebSocketStream<TcpStream>;

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_hdr_async(
        stream,
        |_req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
            resp.headers_mut().insert(
                "sec-websocket-protocol",
                HeaderValue::from_static("graphql-transport-ws"),
            );
            Ok(resp)
        },
    )
    .await
    .unwrap()
}

async fn recv_frame(ws: &mut ServerSocket) -> Value {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

async fn send_frame(ws: &mut ServerSocket, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Accepts a connection and completes the `connection_init` handshake.
async fn handshake(listener: &TcpListener) -> (ServerSocket, Value) {
    let mut ws = accept(listener).await;
    let init = recv_frame(&mut ws).await;
    assert_eq!(init["type"], "connection_init");
    send_frame(&mut ws, json!({"type": "connection_ack"})).await;
    (ws, init)
}

async fn next_event(events: &mut UnboundedReceiver<SubscriptionEvent>) -> SubscriptionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a subscription event")
        .expect("subscription channel closed")
}

fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy::new(Duration::from_millis(10), Duration::from_millis(50))
}

#[tokio::test]
async fn test_reconnect_resumes_without_resubscribing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let server = tokio::spawn(async move {
        let (mut ws, init) = handshake(&listener).await;
        assert_eq!(init["payload"]["headers"]["x-hasura-role"], "viewer");
        let first = recv_frame(&mut ws).await;
        assert_eq!(first["type"], "subscribe");
        let id = first["id"].clone();
        send_frame(
            &mut ws,
            json!({"type": "next", "id": id, "payload": {"data": {"n": 1}}}),
        )
        .await;
        drop(ws);

        let (mut ws, _) = handshake(&listener).await;
        let again = recv_frame(&mut ws).await;
        assert_eq!(again["type"], "subscribe");
        assert_eq!(again["id"], id);
        assert_eq!(again["payload"], first["payload"]);
        send_frame(
            &mut ws,
            json!({"type": "next", "id": id, "payload": {"data": {"n": 2}}}),
        )
        .await;

        let complete = recv_frame(&mut ws).await;
        assert_eq!(complete["type"], "complete");
        assert_eq!(complete["id"], id);
    });

    let connector = create_connector(
        ConnectorConfig::hasura(
            OriginSettings::new("http://127.0.0.1:1/v1/graphql")
                .streaming_endpoint(url)
                .header("X-Hasura-Role", "viewer"),
        )
        .reconnect(fast_reconnect()),
    )
    .unwrap();

    let (handlers, mut events) = SubscriptionHandlers::channel();
    let handle = connector
        .subscribe(
            "subscription ($room: Int!) { messages(room: $room) { n } }",
            Some(json!({"room": 1})),
            handlers,
        )
        .await
        .unwrap();

    match next_event(&mut events).await {
        SubscriptionEvent::Next(data) => assert_eq!(data, json!({"n": 1})),
        other => panic!("unexpected event {:?}", other),
    }
    match next_event(&mut events).await {
        SubscriptionEvent::Next(data) => assert_eq!(data, json!({"n": 2})),
        other => panic!("unexpected event {:?}", other),
    }

    handle.unsubscribe();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_unsubscribe_leaves_other_subscriptions_running() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (subscribed_tx, subscribed_rx) = tokio::sync::oneshot::channel::<Vec<String>>();

    let server = tokio::spawn(async move {
        let (mut ws, _) = handshake(&listener).await;
        let mut ids = Vec::new();
        for _ in 0..2 {
            let frame = recv_frame(&mut ws).await;
            assert_eq!(frame["type"], "subscribe");
            ids.push(frame["id"].as_str().unwrap().to_string());
        }
        subscribed_tx.send(ids.clone()).unwrap();

        let stop = recv_frame(&mut ws).await;
        assert_eq!(stop["type"], "complete");
        let stopped = stop["id"].as_str().unwrap().to_string();
        let remaining = ids.into_iter().find(|id| *id != stopped).unwrap();

        send_frame(
            &mut ws,
            json!({"type": "next", "id": remaining, "payload": {"data": {"b": true}}}),
        )
        .await;
        send_frame(&mut ws, json!({"type": "complete", "id": remaining})).await;
        stopped
    });

    let client = SubscriptionClient::new(
        url,
        GraphQLClient::new("http://127.0.0.1:1/v1/graphql").unwrap(),
        fast_reconnect(),
    )
    .unwrap();
    let (handlers_a, _events_a) = SubscriptionHandlers::channel();
    let (handlers_b, mut events_b) = SubscriptionHandlers::channel();
    let a = client
        .subscribe("subscription { a }", None, handlers_a)
        .await
        .unwrap();
    let b = client
        .subscribe("subscription { b }", None, handlers_b)
        .await
        .unwrap();
    assert_eq!(client.active_count(), 2);

    let mut ids = tokio::time::timeout(Duration::from_secs(5), subscribed_rx)
        .await
        .unwrap()
        .unwrap();
    ids.sort();
    let mut expected = vec![a.id().to_string(), b.id().to_string()];
    expected.sort();
    assert_eq!(ids, expected);

    a.unsubscribe();
    a.unsubscribe();

    match next_event(&mut events_b).await {
        SubscriptionEvent::Next(data) => assert_eq!(data, json!({"b": true})),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(matches!(
        next_event(&mut events_b).await,
        SubscriptionEvent::Complete
    ));
    assert_eq!(client.active_count(), 0);

    let stopped = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stopped, a.id());

    // The socket is released once nothing is subscribed.
    for _ in 0..100 {
        if !client.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!client.is_connected());
}

#[test]
fn test_invalid_streaming_endpoint_is_rejected() {
    let err = create_connector(ConnectorConfig::hasura(
        OriginSettings::new("http://127.0.0.1:1/v1/graphql").streaming_endpoint("not a url"),
    ))
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotConfigured);
}

#[tokio::test]
async fn test_reconnect_backs_off_then_resets_after_success() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let policy = ReconnectPolicy::new(Duration::from_millis(50), Duration::from_millis(200));

    let server = tokio::spawn(async move {
        // Refuse four handshakes by closing the TCP stream right away.
        let mut refused = Vec::new();
        for _ in 0..4 {
            let (stream, _) = listener.accept().await.unwrap();
            refused.push(Instant::now());
            drop(stream);
        }

        let (stream, _) = listener.accept().await.unwrap();
        let accepted = Instant::now();
        let mut ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |_req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                resp.headers_mut().insert(
                    "sec-websocket-protocol",
                    HeaderValue::from_static("graphql-transport-ws"),
                );
                Ok(resp)
            },
        )
        .await
        .unwrap();
        recv_frame(&mut ws).await;
        send_frame(&mut ws, json!({"type": "connection_ack"})).await;
        let subscribe = recv_frame(&mut ws).await;
        let id = subscribe["id"].clone();
        send_frame(
            &mut ws,
            json!({"type": "next", "id": id, "payload": {"data": {"n": 1}}}),
        )
        .await;
        drop(ws);
        let dropped = Instant::now();

        let (mut ws, _) = handshake(&listener).await;
        let resumed = Instant::now();
        recv_frame(&mut ws).await;
        send_frame(
            &mut ws,
            json!({"type": "next", "id": id, "payload": {"data": {"n": 2}}}),
        )
        .await;

        let mut gaps: Vec<Duration> = refused.windows(2).map(|w| w[1] - w[0]).collect();
        gaps.push(accepted - refused[3]);
        (gaps, resumed - dropped, ws)
    });

    let client = SubscriptionClient::new(
        url,
        GraphQLClient::new("http://127.0.0.1:1/v1/graphql").unwrap(),
        policy,
    )
    .unwrap();
    let (handlers, mut events) = SubscriptionHandlers::channel();
    let handle = client
        .subscribe("subscription { n }", None, handlers)
        .await
        .unwrap();

    match next_event(&mut events).await {
        SubscriptionEvent::Next(data) => assert_eq!(data, json!({"n": 1})),
        other => panic!("unexpected event {:?}", other),
    }
    match next_event(&mut events).await {
        SubscriptionEvent::Next(data) => assert_eq!(data, json!({"n": 2})),
        other => panic!("unexpected event {:?}", other),
    }

    let (gaps, after_success, _ws) = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .unwrap()
        .unwrap();

    // Delays are 50, 100, 200, then capped at 200.
    let floors = [50, 100, 200, 200];
    for (gap, floor) in gaps.iter().zip(floors) {
        assert!(*gap >= Duration::from_millis(floor), "{:?} < {}ms", gap, floor);
    }
    assert!(gaps[1] > gaps[0]);
    assert!(gaps[2] > gaps[1]);
    assert!(gaps[3] < Duration::from_millis(400), "cap not applied: {:?}", gaps[3]);

    // A successful open resets the backoff to the base delay.
    assert!(after_success >= Duration::from_millis(50));
    assert!(after_success < Duration::from_millis(200), "{:?}", after_success);

    handle.unsubscribe();
}
