//! Background WebSocket connection loop with handshake and reconnect.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use voxlink_common::{UserId, VoiceError};
use voxlink_config::schema::SignalingConfig;

use super::backoff::Backoff;
use super::client::Shared;
use super::types::SignalingStatus;
use crate::protocol::{AuthToken, SignalingMessage};

/// How a connected session ended.
enum SessionEnd {
    /// Socket closed or errored; reconnect.
    Dropped,
    /// Every client handle is gone; stop for good.
    OwnerGone,
}

// ---------------------------------------------------------------------------
// Connection Loop
// ---------------------------------------------------------------------------

/// Runs until cancelled, the owner goes away, or reconnect attempts run out.
pub(crate) async fn connection_loop(
    config: SignalingConfig,
    token: String,
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<SignalingMessage>,
    cancel: CancellationToken,
) {
    let backoff = Backoff::from_config(&config);
    let mut attempt: u32 = 0;

    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = run_session(&config, &token, &shared, &mut outbound_rx) => outcome,
        };
        shared.set_open(false);

        match outcome {
            Ok(SessionEnd::OwnerGone) => {
                debug!("signaling client dropped, stopping connection loop");
                break;
            }
            Ok(SessionEnd::Dropped) => {
                // A completed handshake resets the schedule.
                attempt = 0;
            }
            Err(e) => {
                warn!(error = %e, attempt, "signaling connection attempt failed");
            }
        }

        attempt += 1;
        if !backoff.allows(attempt) {
            error!(
                attempts = backoff.max_attempts(),
                "signaling reconnect attempts exhausted"
            );
            break;
        }

        let delay = backoff.delay(attempt);
        shared.set_status(SignalingStatus::Reconnecting { attempt });
        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnecting to signaling relay"
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_open(false);
    shared.set_status(SignalingStatus::Disconnected);
}

/// One connection: connect, handshake, then pump frames until it drops.
///
/// Errors before the handshake completes are returned; anything after it
/// ends the session with `SessionEnd::Dropped`.
async fn run_session(
    config: &SignalingConfig,
    token: &str,
    shared: &Shared,
    outbound_rx: &mut mpsc::UnboundedReceiver<SignalingMessage>,
) -> Result<SessionEnd, VoiceError> {
    let handshake_timeout = Duration::from_secs(config.handshake_timeout_secs);
    info!(url = %config.url, "connecting to signaling relay");

    let (ws_stream, _) =
        tokio::time::timeout(handshake_timeout, tokio_tungstenite::connect_async(config.url.as_str()))
            .await
            .map_err(|_| VoiceError::SignalingUnavailable("connect timed out".into()))?
            .map_err(|e| VoiceError::SignalingUnavailable(format!("connect failed: {e}")))?;

    let (mut ws_write, mut ws_read) = ws_stream.split();

    send_frame(
        &mut ws_write,
        &SignalingMessage::Hello {
            token: AuthToken(token.to_string()),
        },
    )
    .await?;

    let user_id = tokio::time::timeout(handshake_timeout, wait_for_ready(&mut ws_read))
        .await
        .map_err(|_| VoiceError::SignalingUnavailable("handshake timed out".into()))??;

    // Anything queued against the previous connection is stale now.
    let mut stale = 0usize;
    while outbound_rx.try_recv().is_ok() {
        stale += 1;
    }
    if stale > 0 {
        debug!(stale, "discarded outbound messages queued before reconnect");
    }

    shared.set_user(user_id.clone());
    shared.set_open(true);
    shared.set_status(SignalingStatus::Connected);
    info!(user = %user_id, "signaling connected");

    let period = Duration::from_secs(config.heartbeat_interval_secs.max(1));
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            frame = ws_read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Some(reply) = handle_inbound(&text, shared) {
                        if let Err(e) = send_frame(&mut ws_write, &reply).await {
                            warn!(error = %e, "failed to answer relay ping");
                            return Ok(SessionEnd::Dropped);
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    info!("signaling relay closed the connection");
                    return Ok(SessionEnd::Dropped);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "signaling websocket error");
                    return Ok(SessionEnd::Dropped);
                }
                Some(Ok(_)) => {}
            },
            outbound = outbound_rx.recv() => match outbound {
                Some(msg) => {
                    if let Err(e) = send_frame(&mut ws_write, &msg).await {
                        warn!(error = %e, kind = msg.kind(), "failed to send signaling message");
                        return Ok(SessionEnd::Dropped);
                    }
                }
                None => {
                    let _ = ws_write.send(WsMessage::Close(None)).await;
                    return Ok(SessionEnd::OwnerGone);
                }
            },
            _ = heartbeat.tick() => {
                if send_frame(&mut ws_write, &SignalingMessage::Ping).await.is_err() {
                    warn!("heartbeat failed, dropping signaling connection");
                    return Ok(SessionEnd::Dropped);
                }
            }
        }
    }
}

/// Fan an inbound frame out to subscribers. Returns a reply to send, if any.
fn handle_inbound(text: &str, shared: &Shared) -> Option<SignalingMessage> {
    match SignalingMessage::decode(text) {
        Ok(SignalingMessage::Ping) => Some(SignalingMessage::Pong),
        Ok(SignalingMessage::Pong) => None,
        Ok(msg) => {
            if let SignalingMessage::Error { message } = &msg {
                warn!(%message, "signaling relay reported an error");
            }
            debug!(kind = msg.kind(), "signaling message received");
            shared.subscribers.broadcast(&msg);
            None
        }
        Err(e) => {
            debug!(error = %e, "dropping unrecognized signaling frame");
            None
        }
    }
}

async fn wait_for_ready<S>(ws_read: &mut S) -> Result<UserId, VoiceError>
where
    S: Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(frame) = ws_read.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match SignalingMessage::decode(&text) {
                Ok(SignalingMessage::Ready { user_id }) => return Ok(user_id),
                Ok(SignalingMessage::Error { message }) => {
                    return Err(VoiceError::SignalingUnavailable(format!(
                        "handshake rejected: {message}"
                    )))
                }
                Ok(other) => debug!(kind = other.kind(), "ignoring frame before ready"),
                Err(e) => debug!(error = %e, "ignoring malformed frame before ready"),
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => return Err(VoiceError::SignalingUnavailable(e.to_string())),
        }
    }
    Err(VoiceError::SignalingUnavailable(
        "connection closed during handshake".into(),
    ))
}

async fn send_frame<S>(ws_write: &mut S, msg: &SignalingMessage) -> Result<(), VoiceError>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = msg.encode()?;
    ws_write
        .send(WsMessage::Text(json.into()))
        .await
        .map_err(|e| VoiceError::Network(e.to_string()))
}
