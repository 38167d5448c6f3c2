//! Authentication module for managing the user's session tokens.
//!
//! This module provides:
//! - `SessionManager`: access/refresh token lifecycle with proactive and
//!   on-demand renewal
//! - `TokenStore`: durable key-value storage for the tokens, backed by a JSON
//!   file (`FileStore`), the OS keychain (`KeyringStore`) or memory
//!   (`MemoryStore`)
//! - `RenewalTimer`: the single cancellable background renewal task
//!
//! Access tokens are treated as expired 5 minutes early and renewed in the
//! background 15 minutes before expiry.

pub mod clock;
pub mod credentials;
pub mod error;
pub mod session;
pub mod store;
pub mod timer;

pub use clock::{Clock, SystemClock};
pub use credentials::KeyringStore;
pub use error::AuthError;
pub use session::{SessionManager, SessionSettings, SessionStatus};
pub use store::{FileStore, MemoryStore, TokenStore};
pub use timer::RenewalTimer;
