//! Facts about the machine the agent runs on

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, UdpSocket};
use sysinfo::System;

/// Host description sent with discovery and status frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostFacts {
    /// Machine name as reported to the collector
    pub machine_name: String,
    pub hostname: String,
    pub cpus: usize,
    /// Total memory in bytes
    pub memory: u64,
    pub version: String,
}

impl HostFacts {
    /// Gather the facts of the current machine
    pub fn detect(server_name: Option<&str>, version: &str) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let mut system = System::new();
        system.refresh_memory();

        Self {
            machine_name: server_name.map(str::to_string).unwrap_or_else(|| hostname.clone()),
            hostname,
            cpus: num_cpus::get(),
            memory: system.total_memory(),
            version: version.to_string(),
        }
    }
}

/// Address of the interface used for outbound traffic, if any
///
/// No packet is sent: connecting a UDP socket only selects a route.
pub fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
