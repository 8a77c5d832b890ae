//! Tunnel descriptors and the connection data derived from them

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::SessionError;

/// Read-only snapshot of a tunnel's connection metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelDescriptor {
    pub tunnel_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    #[serde(default)]
    pub endpoints: Vec<TunnelEndpoint>,

    /// Sub-protocols the host supports; empty means unknown
    #[serde(default)]
    pub protocols: Vec<String>,

    /// Access tokens keyed by scope
    #[serde(default)]
    pub access_tokens: HashMap<String, String>,
}

/// A way of reaching the tunnel host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "connectionMode", rename_all = "camelCase")]
pub enum TunnelEndpoint {
    /// Through the relay service
    #[serde(rename_all = "camelCase")]
    TunnelRelay { client_relay_uri: Url },

    /// Directly to the host (`host:port` addresses)
    #[serde(rename_all = "camelCase")]
    LocalNetwork { host_endpoints: Vec<String> },
}

impl TunnelDescriptor {
    pub fn new(tunnel_id: impl Into<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            cluster_id: None,
            endpoints: Vec::new(),
            protocols: Vec::new(),
            access_tokens: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_relay(mut self, uri: Url) -> Self {
        self.endpoints.push(TunnelEndpoint::TunnelRelay {
            client_relay_uri: uri,
        });
        self
    }

    #[must_use]
    pub fn with_host_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(TunnelEndpoint::LocalNetwork {
            host_endpoints: vec![endpoint.into()],
        });
        self
    }

    #[must_use]
    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_access_token(mut self, scope: impl Into<String>, token: impl Into<String>) -> Self {
        self.access_tokens.insert(scope.into(), token.into());
        self
    }

    /// Token issued for `scope`, if the descriptor carries one
    pub fn access_token(&self, scope: &str) -> Option<&str> {
        self.access_tokens.get(scope).map(String::as_str)
    }
}

/// Endpoints and protocols derived from a descriptor, cached per session
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionData {
    pub tunnel_id: String,
    pub relay_uris: Vec<Url>,
    pub host_endpoints: Vec<String>,
    /// Mutually supported protocols, most preferred first
    pub protocols: Vec<String>,
}

impl ConnectionData {
    /// Derive connection data, intersecting `supported` with the host's protocols
    pub fn from_descriptor(
        descriptor: &TunnelDescriptor,
        supported: &[String],
    ) -> Result<Self, SessionError> {
        let mut relay_uris = Vec::new();
        let mut host_endpoints = Vec::new();
        for endpoint in &descriptor.endpoints {
            match endpoint {
                TunnelEndpoint::TunnelRelay { client_relay_uri } => {
                    relay_uris.push(client_relay_uri.clone())
                }
                TunnelEndpoint::LocalNetwork {
                    host_endpoints: hosts,
                } => host_endpoints.extend(hosts.iter().cloned()),
            }
        }

        if relay_uris.is_empty() && host_endpoints.is_empty() {
            return Err(SessionError::NoConnectionData);
        }

        Ok(Self {
            tunnel_id: descriptor.tunnel_id.clone(),
            relay_uris,
            host_endpoints,
            protocols: negotiate_protocols(supported, &descriptor.protocols)?,
        })
    }
}

/// Protocols from `ours` that `theirs` also supports, in our order
///
/// An empty `theirs` means the host did not advertise, so everything we
/// support is offered and the host picks during the handshake.
pub fn negotiate_protocols(ours: &[String], theirs: &[String]) -> Result<Vec<String>, SessionError> {
    if theirs.is_empty() {
        return Ok(ours.to_vec());
    }
    let common: Vec<String> = ours.iter().filter(|p| theirs.contains(p)).cloned().collect();
    if common.is_empty() {
        return Err(SessionError::ProtocolMismatch {
            offered: ours.to_vec(),
        });
    }
    Ok(common)
}

/// Check that the protocol a host picked was one we offered
pub fn select_protocol(offered: &[String], chosen: Option<&str>) -> Result<String, SessionError> {
    match chosen {
        Some(chosen) if offered.iter().any(|p| p == chosen) => Ok(chosen.to_string()),
        _ => Err(SessionError::ProtocolMismatch {
            offered: offered.to_vec(),
        }),
    }
}
