//! HTTP surface for the Viewra transcoding core.

pub mod http;

pub use http::{build_router, AppState};
