//! The voice session: joins, leaves and local controls on top of the
//! signaling client, membership registry, media pipeline and peer manager.

mod actor;
mod handle;
mod types;

pub use actor::VoiceSession;
pub use handle::VoiceHandle;
pub use types::{LocalUser, SessionDeps, VoiceEvent, VoiceSessionState};
