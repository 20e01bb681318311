//! Viewra transcoding & adaptive-streaming core.
//!
//! Given a media file and a client device profile, decides whether to
//! direct-play, remux or transcode; launches and supervises external
//! encoder processes; publishes the produced segments through a
//! content-addressable store; and supports low-latency seek-ahead during
//! playback.

pub mod config;
pub mod decision;
pub mod encoder;
pub mod fingerprint;
pub mod logging;
pub mod models;
pub mod provider;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod store;
pub mod test_helpers;

mod error;

pub use config::Config;
pub use error::{Error, Result};
