//! Who this agent is and what it reports about the host.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use fleet_common::protocol::RegisterRequest;

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const FALLBACK_ROUTE_TARGET: &str = "8.8.8.8:80";

/// Static facts sent at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub agent_id: String,
    pub name: String,
    pub hostname: String,
    pub ip_address: String,
}

impl Identity {
    /// Detect hostname and outbound address, then apply overrides.
    ///
    /// Without overrides the id is `hostname-ip` and the name `agent-hostname`.
    #[must_use]
    pub fn detect(server_url: &str, agent_id: Option<&str>, name: Option<&str>) -> Self {
        let hostname = hostname();
        let ip = local_ip(server_url);
        Self::from_parts(&hostname, ip, agent_id, name)
    }

    #[must_use]
    pub fn from_parts(
        hostname: &str,
        ip: IpAddr,
        agent_id: Option<&str>,
        name: Option<&str>,
    ) -> Self {
        Self {
            agent_id: non_empty(agent_id)
                .map_or_else(|| format!("{hostname}-{ip}"), str::to_string),
            name: non_empty(name).map_or_else(|| format!("agent-{hostname}"), str::to_string),
            hostname: hostname.to_string(),
            ip_address: ip.to_string(),
        }
    }

    #[must_use]
    pub fn register_request(&self) -> RegisterRequest {
        RegisterRequest {
            agent_id: self.agent_id.clone(),
            agent_name: self.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: capabilities(),
            hostname: self.hostname.clone(),
            ip_address: self.ip_address.clone(),
        }
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn capabilities() -> HashMap<String, String> {
    HashMap::from([
        ("os".to_string(), std::env::consts::OS.to_string()),
        ("arch".to_string(), std::env::consts::ARCH.to_string()),
    ])
}

fn hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "localhost".to_string())
}

/// Address of the interface that routes toward the control plane.
///
/// Connecting a UDP socket sends nothing; it only asks the kernel for a route.
fn local_ip(server_url: &str) -> IpAddr {
    let target = reqwest::Url::parse(server_url)
        .ok()
        .and_then(|url| {
            let host = url.host_str()?.to_string();
            let port = url.port_or_known_default()?;
            Some(format!("{host}:{port}"))
        })
        .unwrap_or_else(|| FALLBACK_ROUTE_TARGET.to_string());

    let route_lookup = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(&target)?;
        Ok(socket.local_addr()?.ip())
    };
    match route_lookup() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => LOOPBACK,
        Err(e) => {
            tracing::debug!(error = %e, target = %target, "local address lookup failed");
            LOOPBACK
        }
    }
}

/// Telemetry attached to every heartbeat.
#[derive(Debug)]
pub struct Metrics {
    started: Instant,
    tasks_completed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            tasks_completed: AtomicU64::new(0),
        }
    }
}

impl Metrics {
    pub fn record_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn tasks_completed(&self) -> u64 {
        self.tasks_completed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::from([
            (
                "tasks_completed".to_string(),
                self.tasks_completed().to_string(),
            ),
            (
                "uptime_secs".to_string(),
                self.started.elapsed().as_secs().to_string(),
            ),
        ]);
        if let Some(load) = load_1m() {
            metrics.insert("load_1m".to_string(), load);
        }
        metrics
    }
}

fn load_1m() -> Option<String> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    parse_load_1m(&loadavg)
}

fn parse_load_1m(loadavg: &str) -> Option<String> {
    let first = loadavg.split_whitespace().next()?;
    first.parse::<f64>().ok()?;
    Some(first.to_string())
}
