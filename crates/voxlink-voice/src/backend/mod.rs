//! Production implementations of the transport and device seams.

#[cfg(feature = "cpal-backend")]
pub mod cpal_io;
#[cfg(feature = "webrtc-backend")]
pub mod rtc;

#[cfg(feature = "cpal-backend")]
pub use cpal_io::{CpalDevices, CpalPlayback};
#[cfg(feature = "webrtc-backend")]
pub use rtc::{WebRtcTransport, WebRtcTransportFactory};
