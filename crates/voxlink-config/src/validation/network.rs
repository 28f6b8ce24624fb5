use super::helpers::{validate_range, validate_range_f64, validate_scheme};
use crate::schema::VoxlinkConfig;

pub(super) fn validate_signaling(errors: &mut Vec<String>, config: &VoxlinkConfig) {
    let s = &config.signaling;
    validate_scheme(errors, "signaling.url", &s.url, &["ws://", "wss://"]);
    validate_range(errors, "signaling.heartbeat_interval_secs", s.heartbeat_interval_secs, 5, 300);
    validate_range(errors, "signaling.handshake_timeout_secs", s.handshake_timeout_secs, 1, 60);
    validate_range(errors, "signaling.reconnect_base_ms", s.reconnect_base_ms, 100, 60_000);
    validate_range_f64(errors, "signaling.reconnect_factor", s.reconnect_factor, 1.0, 4.0);
    validate_range(
        errors,
        "signaling.max_reconnect_attempts",
        u64::from(s.max_reconnect_attempts),
        1,
        50,
    );
    if s.reconnect_max_ms < s.reconnect_base_ms {
        errors.push(format!(
            "signaling.reconnect_max_ms = {} is below reconnect_base_ms = {}",
            s.reconnect_max_ms, s.reconnect_base_ms
        ));
    }
    if matches!(&s.token, Some(t) if t.trim().is_empty()) {
        errors.push("signaling.token must not be blank".into());
    }
}

pub(super) fn validate_api(errors: &mut Vec<String>, config: &VoxlinkConfig) {
    validate_scheme(errors, "api.base_url", &config.api.base_url, &["http://", "https://"]);
    validate_range(errors, "api.timeout_secs", config.api.timeout_secs, 1, 120);
}

pub(super) fn validate_ice(errors: &mut Vec<String>, config: &VoxlinkConfig) {
    let urls = &config.ice.fallback_stun_urls;
    if urls.is_empty() {
        errors.push("ice.fallback_stun_urls must not be empty".into());
    }
    for url in urls {
        validate_scheme(errors, "ice.fallback_stun_urls", url, &["stun:", "stuns:"]);
    }
}

pub(super) fn validate_peer(errors: &mut Vec<String>, config: &VoxlinkConfig) {
    let p = &config.peer;
    validate_range(errors, "peer.disconnect_recheck_ms", p.disconnect_recheck_ms, 500, 60_000);
    validate_range(errors, "peer.negotiation_timeout_ms", p.negotiation_timeout_ms, 1_000, 120_000);
    validate_range(errors, "peer.retry_max_attempts", u64::from(p.retry_max_attempts), 0, 10);
    validate_range(errors, "peer.retry_base_ms", p.retry_base_ms, 100, 30_000);
    validate_range(errors, "peer.stats_interval_ms", p.stats_interval_ms, 250, 60_000);
}
