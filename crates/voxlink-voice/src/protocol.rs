//! Wire schema for the signaling channel.
//!
//! Every frame is a JSON object with a `type` tag. Field names are camelCase on
//! the wire; snake_case spellings are accepted on input because older clients
//! send them. Decoding validates ids at the boundary so handlers never see
//! empty or placeholder identifiers.

use serde::{Deserialize, Serialize};
use voxlink_common::{ChannelId, UserId, VoiceError};

// ---------------------------------------------------------------------------
// Message type names
// ---------------------------------------------------------------------------

pub mod types {
    pub const VOICE_JOIN: &str = "voice-join";
    pub const VOICE_LEAVE: &str = "voice-leave";
    pub const VOICE_OFFER: &str = "voice-offer";
    pub const VOICE_ANSWER: &str = "voice-answer";
    pub const VOICE_ICE_CANDIDATE: &str = "voice-ice-candidate";
    pub const VOICE_STATE_UPDATE: &str = "voice-state-update";
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A user announcing presence in a voice channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    #[serde(alias = "channel_id")]
    pub channel_id: ChannelId,
    #[serde(alias = "user_id")]
    pub user_id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, alias = "is_muted")]
    pub is_muted: bool,
    #[serde(default, alias = "is_deafened")]
    pub is_deafened: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeavePayload {
    #[serde(alias = "channel_id")]
    pub channel_id: ChannelId,
    #[serde(alias = "user_id")]
    pub user_id: UserId,
}

/// SDP offer or answer addressed to one peer.
///
/// `from_user_id` is stamped by the relay; clients leave it empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptionPayload {
    #[serde(alias = "target_user_id")]
    pub target_user_id: UserId,
    #[serde(alias = "channel_id")]
    pub channel_id: ChannelId,
    pub sdp: String,
    #[serde(default, alias = "from_user_id", skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<UserId>,
}

/// An ICE candidate in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, alias = "sdp_mid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, alias = "sdp_m_line_index", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    #[serde(alias = "target_user_id")]
    pub target_user_id: UserId,
    #[serde(alias = "channel_id")]
    pub channel_id: ChannelId,
    pub candidate: IceCandidate,
    #[serde(default, alias = "from_user_id", skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<UserId>,
}

/// Partial participant state. Absent fields leave the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFields {
    #[serde(default, alias = "is_muted", skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    #[serde(default, alias = "is_deafened", skip_serializing_if = "Option::is_none")]
    pub is_deafened: Option<bool>,
    #[serde(default, alias = "is_speaking", skip_serializing_if = "Option::is_none")]
    pub is_speaking: Option<bool>,
    #[serde(default, alias = "has_video", skip_serializing_if = "Option::is_none")]
    pub has_video: Option<bool>,
    #[serde(default, alias = "is_screen_sharing", skip_serializing_if = "Option::is_none")]
    pub is_screen_sharing: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdatePayload {
    #[serde(alias = "channel_id")]
    pub channel_id: ChannelId,
    #[serde(alias = "user_id")]
    pub user_id: UserId,
    #[serde(flatten)]
    pub fields: StateFields,
}

/// Bearer token carried in the handshake. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(pub String);

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken([REDACTED])")
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Every frame exchanged with the signaling relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    #[serde(rename = "voice-join")]
    Join(JoinPayload),
    #[serde(rename = "voice-leave")]
    Leave(LeavePayload),
    #[serde(rename = "voice-offer")]
    Offer(DescriptionPayload),
    #[serde(rename = "voice-answer")]
    Answer(DescriptionPayload),
    #[serde(rename = "voice-ice-candidate")]
    IceCandidate(CandidatePayload),
    #[serde(rename = "voice-state-update")]
    StateUpdate(StateUpdatePayload),

    /// First frame from a client.
    #[serde(rename = "hello")]
    Hello { token: AuthToken },
    /// Relay accepted the handshake.
    #[serde(rename = "ready", rename_all = "camelCase")]
    Ready {
        #[serde(alias = "user_id")]
        user_id: UserId,
    },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error { message: String },
}

impl SignalingMessage {
    /// Parse and validate one inbound text frame.
    pub fn decode(text: &str) -> Result<Self, VoiceError> {
        let msg: SignalingMessage = serde_json::from_str(text)?;
        msg.validate()?;
        Ok(msg)
    }

    pub fn encode(&self) -> Result<String, VoiceError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Reject frames whose ids are empty or placeholders.
    pub fn validate(&self) -> Result<(), VoiceError> {
        let check_channel = |c: &ChannelId| {
            if c.is_valid() {
                Ok(())
            } else {
                Err(VoiceError::Protocol(format!("invalid channel id {c:?}")))
            }
        };
        let check_user = |u: &UserId| {
            if u.is_valid() {
                Ok(())
            } else {
                Err(VoiceError::Protocol(format!("invalid user id {u:?}")))
            }
        };
        match self {
            SignalingMessage::Join(p) => {
                check_channel(&p.channel_id)?;
                check_user(&p.user_id)
            }
            SignalingMessage::Leave(p) => {
                check_channel(&p.channel_id)?;
                check_user(&p.user_id)
            }
            SignalingMessage::Offer(p) | SignalingMessage::Answer(p) => {
                check_channel(&p.channel_id)?;
                check_user(&p.target_user_id)?;
                if p.sdp.is_empty() {
                    return Err(VoiceError::Protocol("empty sdp".into()));
                }
                Ok(())
            }
            SignalingMessage::IceCandidate(p) => {
                check_channel(&p.channel_id)?;
                check_user(&p.target_user_id)
            }
            SignalingMessage::StateUpdate(p) => {
                check_channel(&p.channel_id)?;
                check_user(&p.user_id)
            }
            SignalingMessage::Ready { user_id } => check_user(user_id),
            SignalingMessage::Hello { .. }
            | SignalingMessage::Ping
            | SignalingMessage::Pong
            | SignalingMessage::Error { .. } => Ok(()),
        }
    }

    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Join(_) => types::VOICE_JOIN,
            SignalingMessage::Leave(_) => types::VOICE_LEAVE,
            SignalingMessage::Offer(_) => types::VOICE_OFFER,
            SignalingMessage::Answer(_) => types::VOICE_ANSWER,
            SignalingMessage::IceCandidate(_) => types::VOICE_ICE_CANDIDATE,
            SignalingMessage::StateUpdate(_) => types::VOICE_STATE_UPDATE,
            SignalingMessage::Hello { .. } => "hello",
            SignalingMessage::Ready { .. } => "ready",
            SignalingMessage::Ping => "ping",
            SignalingMessage::Pong => "pong",
            SignalingMessage::Error { .. } => "error",
        }
    }

    /// Channel the message refers to, if any.
    pub fn channel_id(&self) -> Option<&ChannelId> {
        match self {
            SignalingMessage::Join(p) => Some(&p.channel_id),
            SignalingMessage::Leave(p) => Some(&p.channel_id),
            SignalingMessage::Offer(p) | SignalingMessage::Answer(p) => Some(&p.channel_id),
            SignalingMessage::IceCandidate(p) => Some(&p.channel_id),
            SignalingMessage::StateUpdate(p) => Some(&p.channel_id),
            _ => None,
        }
    }

    /// The user a message originates from: the relay stamp for targeted
    /// messages, the subject user for broadcasts.
    pub fn sender(&self) -> Option<&UserId> {
        match self {
            SignalingMessage::Join(p) => Some(&p.user_id),
            SignalingMessage::Leave(p) => Some(&p.user_id),
            SignalingMessage::Offer(p) | SignalingMessage::Answer(p) => p.from_user_id.as_ref(),
            SignalingMessage::IceCandidate(p) => p.from_user_id.as_ref(),
            SignalingMessage::StateUpdate(p) => Some(&p.user_id),
            _ => None,
        }
    }

    /// Recipient of a targeted message.
    pub fn target(&self) -> Option<&UserId> {
        match self {
            SignalingMessage::Offer(p) | SignalingMessage::Answer(p) => Some(&p.target_user_id),
            SignalingMessage::IceCandidate(p) => Some(&p.target_user_id),
            _ => None,
        }
    }

    /// Stamp the originating user on a targeted message.
    pub fn stamp_sender(&mut self, from: &UserId) {
        match self {
            SignalingMessage::Offer(p) | SignalingMessage::Answer(p) => {
                p.from_user_id = Some(from.clone());
            }
            SignalingMessage::IceCandidate(p) => p.from_user_id = Some(from.clone()),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_serializes_camel_case_with_type_tag() {
        let msg = SignalingMessage::Join(JoinPayload {
            channel_id: "general".into(),
            user_id: "7".into(),
            username: "ada".into(),
            avatar: None,
            is_muted: false,
            is_deafened: true,
        });
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "voice-join");
        assert_eq!(json["channelId"], "general");
        assert_eq!(json["userId"], "7");
        assert_eq!(json["isDeafened"], true);
        assert!(json.get("avatar").is_none());
    }

    #[test]
    fn snake_case_fields_are_accepted() {
        let msg = SignalingMessage::decode(
            r#"{"type":"voice-offer","targetUserId":"2","channel_id":"general","sdp":"v=0","from_user_id":"1"}"#,
        )
        .unwrap();
        match msg {
            SignalingMessage::Offer(p) => {
                assert_eq!(p.channel_id.as_str(), "general");
                assert_eq!(p.from_user_id, Some(UserId::new("1")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let msg = SignalingMessage::decode(
            r#"{"type":"voice-ice-candidate","targetUserId":"2","channelId":"g","candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();
        let SignalingMessage::IceCandidate(p) = msg else {
            panic!("expected candidate");
        };
        assert_eq!(p.candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(p.candidate.sdp_m_line_index, Some(0));
        assert!(p.from_user_id.is_none());
    }

    #[test]
    fn state_update_fields_are_partial() {
        let msg = SignalingMessage::decode(
            r#"{"type":"voice-state-update","channelId":"g","userId":"3","is_speaking":true}"#,
        )
        .unwrap();
        let SignalingMessage::StateUpdate(p) = msg else {
            panic!("expected state update");
        };
        assert_eq!(p.fields.is_speaking, Some(true));
        assert_eq!(p.fields.is_muted, None);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = SignalingMessage::decode(r#"{"type":"voice-teleport","channelId":"g"}"#);
        assert!(matches!(err, Err(VoiceError::Protocol(_))));
    }

    #[test]
    fn placeholder_ids_are_rejected() {
        let err = SignalingMessage::decode(
            r#"{"type":"voice-leave","channelId":"undefined","userId":"3"}"#,
        );
        assert!(matches!(err, Err(VoiceError::Protocol(_))));
    }

    #[test]
    fn empty_sdp_is_rejected() {
        let err = SignalingMessage::decode(
            r#"{"type":"voice-answer","targetUserId":"2","channelId":"g","sdp":""}"#,
        );
        assert!(matches!(err, Err(VoiceError::Protocol(_))));
    }

    #[test]
    fn transport_frames_round_trip() {
        let ping = SignalingMessage::decode(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, SignalingMessage::Ping);
        let ready = SignalingMessage::decode(r#"{"type":"ready","userId":"9"}"#).unwrap();
        assert_eq!(ready, SignalingMessage::Ready { user_id: "9".into() });
    }

    #[test]
    fn hello_debug_hides_token() {
        let hello = SignalingMessage::Hello {
            token: AuthToken("secret-token".into()),
        };
        assert!(!format!("{hello:?}").contains("secret-token"));
        assert!(hello.encode().unwrap().contains("secret-token"));
    }

    #[test]
    fn stamp_sender_only_touches_targeted_messages() {
        let mut offer = SignalingMessage::Offer(DescriptionPayload {
            target_user_id: "2".into(),
            channel_id: "g".into(),
            sdp: "v=0".into(),
            from_user_id: None,
        });
        offer.stamp_sender(&"1".into());
        assert_eq!(offer.sender(), Some(&UserId::new("1")));
        assert_eq!(offer.target(), Some(&UserId::new("2")));

        let mut leave = SignalingMessage::Leave(LeavePayload {
            channel_id: "g".into(),
            user_id: "5".into(),
        });
        leave.stamp_sender(&"1".into());
        assert_eq!(leave.sender(), Some(&UserId::new("5")));
    }
}
