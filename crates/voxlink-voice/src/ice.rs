//! ICE configuration provider.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{info, warn};
use voxlink_common::VoiceError;
use voxlink_config::schema::IceConfig;

use crate::api::VoiceApi;

/// One STUN/TURN server entry. `urls` accepts a string or a list on input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceSource {
    Endpoint,
    Fallback,
}

/// ICE servers used for every peer connection of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub servers: Vec<IceServer>,
    pub source: IceSource,
}

/// Fetches ICE servers once per call and caches them.
///
/// Any failure (transport, non-2xx, malformed or empty body) falls back to
/// the configured STUN-only list; call setup is never blocked on it.
pub struct IceConfigProvider {
    api: Arc<dyn VoiceApi>,
    fallback: Vec<String>,
    cached: Option<IceServerConfig>,
}

impl IceConfigProvider {
    pub fn new(api: Arc<dyn VoiceApi>, config: &IceConfig) -> Self {
        Self {
            api,
            fallback: config.fallback_stun_urls.clone(),
            cached: None,
        }
    }

    /// Cached config, fetching it on first use.
    pub async fn fetch(&mut self) -> IceServerConfig {
        if let Some(cached) = &self.cached {
            return cached.clone();
        }
        let config = match self.api.ice_servers().await {
            Ok(servers) if !servers.is_empty() => {
                info!(count = servers.len(), "using ICE servers from endpoint");
                IceServerConfig {
                    servers,
                    source: IceSource::Endpoint,
                }
            }
            Ok(_) => self.fallback_with(VoiceError::IceServersUnavailable("empty list".into())),
            Err(e) => self.fallback_with(VoiceError::IceServersUnavailable(e.to_string())),
        };
        self.cached = Some(config.clone());
        config
    }

    pub fn cached(&self) -> Option<&IceServerConfig> {
        self.cached.as_ref()
    }

    /// Forget the cached config; the next call fetches again.
    pub fn reset(&mut self) {
        self.cached = None;
    }

    fn fallback_with(&self, err: VoiceError) -> IceServerConfig {
        warn!(error = %err, "falling back to public STUN servers");
        IceServerConfig {
            servers: self.fallback.iter().cloned().map(IceServer::stun).collect(),
            source: IceSource::Fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeVoiceApi;

    #[tokio::test]
    async fn fetches_once_and_caches() {
        let api = Arc::new(FakeVoiceApi::default());
        api.set_ice_servers(Ok(vec![IceServer {
            urls: vec!["turn:relay.example.com:3478".into()],
            username: Some("u".into()),
            credential: Some("p".into()),
        }]));
        let mut provider = IceConfigProvider::new(api.clone(), &IceConfig::default());

        let first = provider.fetch().await;
        let second = provider.fetch().await;
        assert_eq!(first, second);
        assert_eq!(first.source, IceSource::Endpoint);
        assert_eq!(api.ice_calls(), 1);

        provider.reset();
        provider.fetch().await;
        assert_eq!(api.ice_calls(), 2);
    }

    #[tokio::test]
    async fn failure_falls_back_to_stun_list() {
        let api = Arc::new(FakeVoiceApi::default());
        api.set_ice_servers(Err(VoiceError::Network("503".into())));
        let mut provider = IceConfigProvider::new(api.clone(), &IceConfig::default());

        let config = provider.fetch().await;
        assert_eq!(config.source, IceSource::Fallback);
        assert_eq!(config.servers.len(), 4);
        assert_eq!(config.servers[0].urls, vec!["stun:stun.l.google.com:19302".to_string()]);
        assert!(config.servers.iter().all(|s| s.credential.is_none()));

        provider.fetch().await;
        assert_eq!(api.ice_calls(), 1);
    }

    #[tokio::test]
    async fn empty_list_falls_back() {
        let api = Arc::new(FakeVoiceApi::default());
        api.set_ice_servers(Ok(vec![]));
        let mut provider = IceConfigProvider::new(api, &IceConfig::default());
        assert_eq!(provider.fetch().await.source, IceSource::Fallback);
    }
}
