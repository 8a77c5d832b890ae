//! Tunnel directory lookups

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::TunnelDescriptor;
use crate::auth::AccessScope;
use crate::error::SessionError;

/// Resolves tunnel ids to descriptors
#[async_trait]
pub trait TunnelDirectory: Send + Sync {
    async fn get_tunnel(
        &self,
        tunnel_id: &str,
        scope: &AccessScope,
        cancel: &CancellationToken,
    ) -> Result<TunnelDescriptor, SessionError>;
}

/// In-memory directory
#[derive(Debug, Default)]
pub struct StaticTunnelDirectory {
    tunnels: RwLock<HashMap<String, TunnelDescriptor>>,
}

impl StaticTunnelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, descriptor: TunnelDescriptor) {
        self.tunnels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(descriptor.tunnel_id.clone(), descriptor);
    }
}

impl FromIterator<TunnelDescriptor> for StaticTunnelDirectory {
    fn from_iter<I: IntoIterator<Item = TunnelDescriptor>>(iter: I) -> Self {
        let directory = Self::new();
        for descriptor in iter {
            directory.insert(descriptor);
        }
        directory
    }
}

#[async_trait]
impl TunnelDirectory for StaticTunnelDirectory {
    async fn get_tunnel(
        &self,
        tunnel_id: &str,
        _scope: &AccessScope,
        cancel: &CancellationToken,
    ) -> Result<TunnelDescriptor, SessionError> {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        self.tunnels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tunnel_id)
            .cloned()
            .ok_or(SessionError::NoConnectionData)
    }
}
