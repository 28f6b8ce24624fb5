pub mod errors;
pub mod id;

pub use errors::{ConfigError, MediaError, VoiceError};
pub use id::{new_id, ChannelId, UserId};

pub type Result<T> = std::result::Result<T, VoiceError>;
