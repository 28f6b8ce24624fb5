//! Default TOML config template with inline documentation comments.

pub(crate) fn default_config_toml() -> String {
    r##"# Voxlink Configuration
# Schema version 1
# Only override what you want to change -- missing fields use defaults.

[signaling]
# url = "ws://127.0.0.1:8000/ws"
# token = "..."                  # required; no connection is attempted without it
# heartbeat_interval_secs = 25   # 5-300
# handshake_timeout_secs = 10    # 1-60
# reconnect_base_ms = 5000
# reconnect_factor = 1.5         # 1.0-4.0
# reconnect_max_ms = 30000
# max_reconnect_attempts = 5     # 1-50

[api]
# base_url = "http://127.0.0.1:8000"
# timeout_secs = 10              # 1-120

[ice]
# fallback_stun_urls = [
#   "stun:stun.l.google.com:19302",
#   "stun:stun1.l.google.com:19302",
#   "stun:stun2.l.google.com:19302",
#   "stun:stun3.l.google.com:19302",
# ]

[audio]
# sample_rate = 48000            # 8000-96000
# frame_ms = 20                  # 5-100
# highpass_hz = 80.0
# lowpass_hz = 12000.0
# gate_ramp_ms = 10.0
# input_volume = 1.0             # 0.0-2.0
# max_audio_bitrate = 128000

[audio.compressor]
# threshold_db = -24.0
# knee_db = 30.0
# ratio = 12.0                   # 1-20
# attack_ms = 3.0
# release_ms = 250.0

[audio.camera]
# width = 640
# height = 480
# frame_rate = 30

[audio.screen]
# width = 1920
# height = 1080
# frame_rate = 30

[vad]
# tick_ms = 20
# fft_size = 512                 # power of two, 64-8192
# band_low_hz = 300.0
# band_high_hz = 3400.0
# smoothing = 0.7                # 0.0-0.99
# min_db = -100.0
# max_db = -30.0
# local_threshold = 15.0         # 0-255
# remote_threshold = 15.0        # 0-255
# local_hold_ms = 160
# remote_hold_ms = 200

[peer]
# disconnect_recheck_ms = 5000
# negotiation_timeout_ms = 15000
# retry_max_attempts = 3         # 0-10
# retry_base_ms = 1000
# stats_interval_ms = 2000
"##
    .to_string()
}
