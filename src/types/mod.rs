//! Type definitions for bearer-session
//!
//! Credentials, configuration, and the in-memory session with its
//! freshness rules.

pub mod credentials;
pub mod options;
pub mod session;

pub use credentials::{Credentials, DeviceCredentials, PasswordCredentials, RefreshPolicy};
pub use options::{SessionConfig, SessionConfigBuilder};
pub use session::{FreshnessWindows, Session, TokenAction, TokenState};
