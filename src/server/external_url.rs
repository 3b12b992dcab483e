//! External websocket URL derivation
//!
//! Other nodes reach this one through the URL written into the publish
//! registry. It can be configured explicitly; otherwise it is derived from
//! the first usable IPv4 address of the host.

use std::net::IpAddr;

use super::config::ServerConfig;

/// Figures out the external websocket URL of this node
///
/// Returns the configured `EXTERNAL_WEBSOCKET_URL` when set. Otherwise
/// scans the host interfaces and builds `ws[s]://<ip>:<port><prefix>` from
/// the first non-loopback, non-multicast, non-link-local IPv4 address.
/// Returns the empty string when no candidate exists; announcing is then
/// disabled.
pub fn figure_out_external_websocket_url(config: &ServerConfig) -> String {
    if !config.external_websocket_url.is_empty() {
        return config.external_websocket_url.clone();
    }

    let (proto, port) = if config.tls_enabled {
        ("wss", config.tls_port)
    } else {
        ("ws", config.http_port)
    };

    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            tracing::error!(error = %e, "Error loading network interfaces");
            return String::new();
        }
    };

    for interface in interfaces {
        let ip = interface.ip();

        if interface.is_loopback() || ip.is_multicast() {
            continue;
        }

        if let IpAddr::V4(v4) = ip {
            if v4.is_link_local() {
                continue;
            }

            return format!("{}://{}:{}{}", proto, v4, port, config.websocket_prefix);
        }
    }

    String::new()
}
