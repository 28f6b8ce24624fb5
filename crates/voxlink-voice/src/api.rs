//! REST collaborator: ICE servers and participant snapshots.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use voxlink_common::{ChannelId, UserId, VoiceError};
use voxlink_config::schema::ApiConfig;

use crate::ice::IceServer;
use crate::membership::ParticipantState;

/// One occupant as reported by the participants endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParticipantSnapshot {
    #[serde(alias = "userId")]
    pub user_id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default, alias = "isMuted")]
    pub is_muted: bool,
    #[serde(default, alias = "isDeafened")]
    pub is_deafened: bool,
}

impl From<ParticipantSnapshot> for ParticipantState {
    fn from(s: ParticipantSnapshot) -> Self {
        let username = s.username.filter(|u| !u.is_empty()).unwrap_or_else(|| "User".into());
        Self {
            avatar: s.avatar,
            is_muted: s.is_muted,
            is_deafened: s.is_deafened,
            ..ParticipantState::new(s.user_id, username)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IceServersResponse {
    ice_servers: Vec<IceServer>,
}

/// External REST endpoints the voice session depends on.
#[async_trait]
pub trait VoiceApi: Send + Sync {
    /// `GET /api/rtc/ice-servers`.
    async fn ice_servers(&self) -> Result<Vec<IceServer>, VoiceError>;

    /// `GET /api/voice/channels/{id}/participants`.
    async fn channel_participants(
        &self,
        channel: &ChannelId,
    ) -> Result<Vec<ParticipantSnapshot>, VoiceError>;
}

/// [`VoiceApi`] over HTTP with a bearer token.
pub struct HttpVoiceApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpVoiceApi {
    /// Fails with `SignalingUnavailable` when `token` is missing or blank;
    /// no request is ever sent without credentials.
    pub fn new(config: &ApiConfig, token: Option<String>) -> Result<Self, VoiceError> {
        let token = token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| VoiceError::SignalingUnavailable("no auth token configured".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VoiceError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, VoiceError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| VoiceError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(VoiceError::Network(format!("GET {path} returned {status}")));
        }
        debug!(path, "api request succeeded");
        response
            .json::<T>()
            .await
            .map_err(|e| VoiceError::Protocol(format!("GET {path}: {e}")))
    }
}

#[async_trait]
impl VoiceApi for HttpVoiceApi {
    async fn ice_servers(&self) -> Result<Vec<IceServer>, VoiceError> {
        let body: IceServersResponse = self.get_json("/api/rtc/ice-servers").await?;
        Ok(body.ice_servers)
    }

    async fn channel_participants(
        &self,
        channel: &ChannelId,
    ) -> Result<Vec<ParticipantSnapshot>, VoiceError> {
        // Entries without a usable id are skipped rather than failing the list.
        let raw: Vec<serde_json::Value> = self
            .get_json(&format!("/api/voice/channels/{channel}/participants"))
            .await?;
        Ok(raw
            .into_iter()
            .filter_map(|v| serde_json::from_value::<ParticipantSnapshot>(v).ok())
            .filter(|p| p.user_id.is_valid())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_accepts_numeric_ids_and_missing_fields() {
        let snap: ParticipantSnapshot =
            serde_json::from_str(r#"{"user_id": 17, "username": "kit"}"#).unwrap();
        assert_eq!(snap.user_id.as_str(), "17");
        assert!(!snap.is_muted);

        let state: ParticipantState = snap.into();
        assert_eq!(state.username, "kit");
        assert_eq!(state.volume, 100);
    }

    #[test]
    fn snapshot_without_username_defaults() {
        let snap: ParticipantSnapshot =
            serde_json::from_str(r#"{"user_id": "9", "is_deafened": true}"#).unwrap();
        let state: ParticipantState = snap.into();
        assert_eq!(state.username, "User");
        assert!(state.is_deafened);
    }

    #[test]
    fn ice_response_parses_string_and_list_urls() {
        let body: IceServersResponse = serde_json::from_str(
            r#"{"iceServers":[{"urls":"stun:a:3478"},{"urls":["turn:b:3478","turns:b:5349"],"username":"u","credential":"c"}]}"#,
        )
        .unwrap();
        assert_eq!(body.ice_servers.len(), 2);
        assert_eq!(body.ice_servers[0].urls, vec!["stun:a:3478".to_string()]);
        assert_eq!(body.ice_servers[1].username.as_deref(), Some("u"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_network_error() {
        let config = ApiConfig {
            base_url: "http://127.0.0.1:1".into(),
            timeout_secs: 2,
        };
        let api = HttpVoiceApi::new(&config, Some("t".into())).unwrap();
        assert!(matches!(api.ice_servers().await, Err(VoiceError::Network(_))));
    }

    #[test]
    fn missing_or_blank_token_is_refused() {
        let config = ApiConfig::default();
        for token in [None, Some(String::new()), Some("   ".into())] {
            let err = HttpVoiceApi::new(&config, token).err();
            assert!(matches!(err, Some(VoiceError::SignalingUnavailable(_))));
        }
        assert!(HttpVoiceApi::new(&config, Some("t".into())).is_ok());
    }
}
