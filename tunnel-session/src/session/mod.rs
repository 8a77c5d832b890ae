//! Tunnel session lifecycle

mod controller;
mod state;

pub use controller::{ConnectAttempt, TunnelSessionController, TunnelSessionControllerBuilder};
pub use state::SessionState;
