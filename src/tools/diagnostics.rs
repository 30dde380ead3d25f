//! `twinview diagnose`

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::utils::{check_tcp_port, local_addresses, resolve, InterfaceAddr};

/// Connect timeout for the remote port check
pub const PORT_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Findings of one diagnostics run
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsReport {
    pub interfaces: Vec<InterfaceAddr>,
    pub remote: String,
    pub resolved: Vec<SocketAddr>,
    pub resolve_error: Option<String>,
    /// Address the port check succeeded on
    pub reachable: Option<SocketAddr>,
    pub port_error: Option<String>,
    pub local_port: u16,
}

impl DiagnosticsReport {
    pub fn remote_reachable(&self) -> bool {
        self.reachable.is_some()
    }

    /// Process exit code: 0 only when the remote port answered
    pub fn exit_code(&self) -> i32 {
        if self.remote_reachable() {
            0
        } else {
            1
        }
    }

    fn remote_is_local(&self) -> bool {
        self.resolved
            .iter()
            .any(|r| self.interfaces.iter().any(|i| i.addr == r.ip()))
    }

    /// Hints for the operator derived from the findings
    pub fn recommendations(&self) -> Vec<String> {
        let mut hints = Vec::new();
        if self.resolve_error.is_some() {
            hints.push(format!(
                "Remote host in {} does not resolve; use an IP address or fix DNS/mDNS",
                self.remote
            ));
        } else if !self.remote_reachable() {
            hints.push(format!(
                "Nothing is listening at {}; start twinview on the peer and check its local.port",
                self.remote
            ));
            hints.push("Check that a firewall allows inbound TCP on the peer port".to_string());
        }
        if self.remote_is_local() {
            hints.push(format!(
                "Remote address points at this machine; make sure remote.port differs from local.port ({})",
                self.local_port
            ));
        }
        if self
            .interfaces
            .iter()
            .all(|i| i.addr.is_loopback() || is_link_local(&i.addr))
        {
            hints.push("No routable interface address found; check the network connection".to_string());
        }
        hints
    }

    /// Human readable report
    pub fn render(&self, config: &AppConfig) -> String {
        let mut out = String::new();
        out.push_str("== Local interfaces ==\n");
        for iface in &self.interfaces {
            out.push_str(&format!("  {:<10} {}\n", iface.interface, iface.addr));
        }

        out.push_str("\n== Remote ==\n");
        out.push_str(&format!("  address:   {}\n", self.remote));
        match &self.resolve_error {
            Some(e) => out.push_str(&format!("  resolve:   FAILED ({})\n", e)),
            None => {
                let list: Vec<String> = self.resolved.iter().map(|a| a.to_string()).collect();
                out.push_str(&format!("  resolve:   {}\n", list.join(", ")));
            }
        }
        match (&self.reachable, &self.port_error) {
            (Some(addr), _) => out.push_str(&format!("  port:      open ({})\n", addr)),
            (None, Some(e)) => out.push_str(&format!("  port:      closed ({})\n", e)),
            (None, None) => out.push_str("  port:      not checked\n"),
        }

        out.push_str("\n== Configuration ==\n");
        out.push_str(&format!(
            "  publish:   {}:{}\n",
            config.local.bind_address, config.local.port
        ));
        out.push_str(&format!("  fps:       {}\n", config.stream.fps));
        out.push_str(&format!(
            "  freshness: {} ms, receive timeout: {} ms\n",
            config.stream.freshness_ms, config.stream.receive_timeout_ms
        ));
        out.push_str(&format!(
            "  reconnect: {} failures, {} ms cooldown\n",
            config.stream.failure_threshold, config.stream.reconnect_cooldown_ms
        ));

        let hints = self.recommendations();
        if !hints.is_empty() {
            out.push_str("\n== Recommendations ==\n");
            for hint in hints {
                out.push_str(&format!("  - {}\n", hint));
            }
        }
        out
    }
}

fn is_link_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Collect interface, resolution and reachability findings for `config`
pub async fn run_diagnostics(config: &AppConfig) -> DiagnosticsReport {
    let mut report = DiagnosticsReport {
        remote: config.remote.address(),
        local_port: config.local.port,
        ..Default::default()
    };

    match local_addresses() {
        Ok(addrs) => report.interfaces = addrs,
        Err(e) => warn!("Failed to list interfaces: {}", e),
    }

    match resolve(&config.remote.host, config.remote.port).await {
        Ok(addrs) if !addrs.is_empty() => report.resolved = addrs,
        Ok(_) => report.resolve_error = Some("no addresses".to_string()),
        Err(e) => report.resolve_error = Some(e.to_string()),
    }

    for addr in &report.resolved {
        debug!("Checking TCP {}", addr);
        match check_tcp_port(*addr, PORT_CHECK_TIMEOUT).await {
            Ok(()) => {
                info!("Remote port reachable at {}", addr);
                report.reachable = Some(*addr);
                report.port_error = None;
                break;
            }
            Err(e) => report.port_error = Some(e.to_string()),
        }
    }

    report
}
