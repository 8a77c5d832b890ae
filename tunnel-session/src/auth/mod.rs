//! Access tokens for tunnel sessions
//!
//! Tokens are opaque bearer strings scoped to a capability. The
//! [`TokenStore`] holds the session's current token and funnels refreshes
//! through a [`TokenProvider`].

mod provider;
mod store;
mod token;

pub use provider::{CallbackTokenProvider, StaticTokenProvider, TokenProvider};
pub use store::TokenStore;
pub use token::{AccessScope, AccessToken};
