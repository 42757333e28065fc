//! Session state
//!
//! The stage machine every connection drives, plus the URL grammar that
//! turns tcUrl + stream name into a registry anchor.

pub mod state;
pub mod url;

pub use state::{SessionState, Stage};
pub use url::StreamTarget;
