//! Per-connection handler: authenticate, register, then route messages.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use voxlink_common::UserId;
use voxlink_voice::protocol::SignalingMessage;

use crate::auth::TokenMap;
use crate::roster::Hub;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Handle a single WebSocket connection.
pub async fn handle_connection(
    ws: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    hub: Hub,
    tokens: TokenMap,
    hello_timeout: Duration,
) {
    let (mut sink, mut stream) = ws.split();

    // 1. Authenticate.
    let user = match read_hello(&mut stream, addr, hello_timeout).await {
        Some(token) => match tokens.authenticate(&token) {
            Some(user) => user,
            None => {
                tracing::warn!(peer = %addr, "Rejected unknown token");
                let _ = send_message(
                    &mut sink,
                    &SignalingMessage::Error {
                        message: "unauthorized".into(),
                    },
                )
                .await;
                return;
            }
        },
        None => return,
    };

    // 2. Register and confirm.
    let (tx, mut rx) = mpsc::channel::<String>(256);
    let conn = hub.register(&user, tx).await;
    if send_message(&mut sink, &SignalingMessage::Ready { user_id: user.clone() })
        .await
        .is_err()
    {
        hub.disconnect(&user, conn).await;
        return;
    }
    let clients = hub.count().await;
    tracing::info!(peer = %addr, user = %user, clients, "Client registered");

    // 3. Routing loop.
    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                // Replaced by a newer connection for the same user.
                None => break,
            },

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => handle_text(&hub, &user, &text).await,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(peer = %addr, error = %e, "WS error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // 4. Cleanup.
    let left = hub.disconnect(&user, conn).await;
    tracing::info!(peer = %addr, user = %user, channels = left.len(), "Client disconnected");
}

async fn handle_text(hub: &Hub, user: &UserId, text: &str) {
    match SignalingMessage::decode(text) {
        Ok(msg) => {
            let kind = msg.kind();
            let routed = hub.route(user, msg).await;
            tracing::debug!(user = %user, kind, ?routed, "Routed message");
        }
        Err(e) => {
            tracing::debug!(user = %user, error = %e, "Invalid message");
            hub.reply(
                user,
                &SignalingMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
        }
    }
}

/// Wait for the hello frame and return its token.
async fn read_hello(stream: &mut WsStream, addr: SocketAddr, timeout: Duration) -> Option<String> {
    let frame = tokio::time::timeout(timeout, stream.next()).await;

    match frame {
        Ok(Some(Ok(Message::Text(text)))) => match SignalingMessage::decode(&text) {
            Ok(SignalingMessage::Hello { token }) => Some(token.0),
            Ok(other) => {
                tracing::warn!(peer = %addr, kind = other.kind(), "Expected hello");
                None
            }
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "Invalid hello message");
                None
            }
        },
        Ok(Some(Ok(_))) => {
            tracing::warn!(peer = %addr, "Expected text hello, got binary");
            None
        }
        Ok(Some(Err(e))) => {
            tracing::warn!(peer = %addr, error = %e, "WS error during hello");
            None
        }
        Ok(None) => {
            tracing::debug!(peer = %addr, "Connection closed before hello");
            None
        }
        Err(_) => {
            tracing::warn!(peer = %addr, "Hello timeout");
            None
        }
    }
}

async fn send_message(sink: &mut WsSink, msg: &SignalingMessage) -> Result<(), String> {
    let json = msg.encode().map_err(|e| e.to_string())?;
    sink.send(Message::Text(json.into())).await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream};
    use voxlink_common::ChannelId;
    use voxlink_voice::protocol::{AuthToken, DescriptionPayload, JoinPayload};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_relay(tokens: TokenMap) -> (SocketAddr, Hub) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hub = Hub::new();
        let accept_hub = hub.clone();
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let hub = accept_hub.clone();
                let tokens = tokens.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = accept_async(stream).await {
                        handle_connection(ws, peer, hub, tokens, Duration::from_secs(2)).await;
                    }
                });
            }
        });
        (addr, hub)
    }

    // Compile-time check: the accept loop spawns this future.
    #[allow(dead_code)]
    fn connection_future_is_send(ws: WebSocketStream<TcpStream>, addr: SocketAddr, hub: Hub) {
        fn require_send<F: Send>(_: F) {}
        require_send(handle_connection(ws, addr, hub, TokenMap::default(), Duration::ZERO));
    }

    async fn send(client: &mut Client, msg: &SignalingMessage) {
        client
            .send(Message::Text(msg.encode().unwrap().into()))
            .await
            .unwrap();
    }

    async fn recv(client: &mut Client) -> SignalingMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("frame within timeout")
                .expect("stream open")
                .expect("frame ok");
            if let Message::Text(text) = frame {
                return SignalingMessage::decode(&text).unwrap();
            }
        }
    }

    async fn login(addr: SocketAddr, token: &str) -> (Client, SignalingMessage) {
        let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        send(
            &mut client,
            &SignalingMessage::Hello {
                token: AuthToken(token.into()),
            },
        )
        .await;
        let reply = recv(&mut client).await;
        (client, reply)
    }

    #[tokio::test]
    async fn handshake_returns_the_mapped_user() {
        let tokens = TokenMap::from_args(&["t-alice=alice".into()]).unwrap();
        let (addr, _hub) = start_relay(tokens).await;

        let (_client, reply) = login(addr, "t-alice").await;
        assert_eq!(
            reply,
            SignalingMessage::Ready {
                user_id: UserId::from("alice")
            }
        );
    }

    #[tokio::test]
    async fn unknown_token_is_refused() {
        let tokens = TokenMap::from_args(&["t-alice=alice".into()]).unwrap();
        let (addr, hub) = start_relay(tokens).await;

        let (_client, reply) = login(addr, "wrong").await;
        assert!(matches!(reply, SignalingMessage::Error { .. }));
        assert_eq!(hub.count().await, 0);
    }

    #[tokio::test]
    async fn offers_flow_between_clients() {
        let (addr, _hub) = start_relay(TokenMap::default()).await;
        let (mut alice, _) = login(addr, "alice").await;
        let (mut bob, _) = login(addr, "bob").await;

        send(
            &mut alice,
            &SignalingMessage::Offer(DescriptionPayload {
                target_user_id: UserId::from("bob"),
                channel_id: ChannelId::from("general"),
                sdp: "v=0".into(),
                from_user_id: None,
            }),
        )
        .await;

        match recv(&mut bob).await {
            SignalingMessage::Offer(p) => assert_eq!(p.from_user_id, Some(UserId::from("alice"))),
            other => panic!("expected offer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_a_client_broadcasts_leave() {
        let (addr, hub) = start_relay(TokenMap::default()).await;
        let (mut alice, _) = login(addr, "alice").await;
        let (mut bob, _) = login(addr, "bob").await;

        send(
            &mut alice,
            &SignalingMessage::Join(JoinPayload {
                channel_id: ChannelId::from("general"),
                user_id: UserId::from("alice"),
                username: "Alice".into(),
                avatar: None,
                is_muted: false,
                is_deafened: false,
            }),
        )
        .await;
        assert!(matches!(recv(&mut bob).await, SignalingMessage::Join(_)));

        alice.close(None).await.unwrap();
        match recv(&mut bob).await {
            SignalingMessage::Leave(p) => assert_eq!(p.user_id, UserId::from("alice")),
            other => panic!("expected leave, got {other:?}"),
        }
        assert!(hub.roster(&ChannelId::from("general")).await.is_empty());
    }

    #[tokio::test]
    async fn ping_is_answered() {
        let (addr, _hub) = start_relay(TokenMap::default()).await;
        let (mut alice, _) = login(addr, "alice").await;
        send(&mut alice, &SignalingMessage::Ping).await;
        assert_eq!(recv(&mut alice).await, SignalingMessage::Pong);
    }
}
