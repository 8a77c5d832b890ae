//! Tunnel metadata: descriptors, derived connection data and directory lookups

mod descriptor;
mod directory;

pub use descriptor::{
    ConnectionData, TunnelDescriptor, TunnelEndpoint, negotiate_protocols, select_protocol,
};
pub use directory::{StaticTunnelDirectory, TunnelDirectory};
