//! Resolves a [`AddressSelector`](crate::config::AddressSelector) to a
//! concrete bindable [`SocketAddr`] (spec.md §3, node descriptor lifetime;
//! §6, external interfaces).
//!
//! The selector is plain text; the shape is sniffed here rather than at
//! config-deserialization time, since a CIDR block, an interface name,
//! and a literal host all parse as equally valid JSON strings. A value
//! containing `/` is treated as a CIDR (the first matching local
//! interface address is picked); otherwise a literal host or `host:port`
//! is tried first, and a named interface last. Borrowed from the pack's
//! `local-ip-address`-based address resolution
//! (`Humans-Not-Required-local-agent-chat`), paired with `ipnet` for CIDR
//! matching.

use crate::config::AddressSelector;
use crate::error::TransportError;
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};

/// Resolve a selector + port into a concrete [`SocketAddr`] to bind.
pub fn resolve(selector: &AddressSelector, port: u16) -> Result<SocketAddr, TransportError> {
    let value = selector.0.as_str();

    if value.contains('/') {
        return resolve_cidr(value, port);
    }

    if let Ok(ip) = value.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    // A literal may already carry its own port (host:port); prefer that
    // over the default if present.
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }

    resolve_interface(value, port)
}

fn resolve_cidr(cidr: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let net: IpNet = cidr
        .parse()
        .map_err(|_| TransportError::UnresolvableAddress(cidr.to_string()))?;

    let local_ip = local_ip_address::local_ip()
        .map_err(|_| TransportError::UnresolvableAddress(cidr.to_string()))?;

    if net.contains(&local_ip) {
        return Ok(SocketAddr::new(local_ip, port));
    }

    for iface in local_ip_address::list_afinet_netifas()
        .map_err(|_| TransportError::UnresolvableAddress(cidr.to_string()))?
    {
        let (_, addr) = iface;
        if net.contains(&addr) {
            return Ok(SocketAddr::new(addr, port));
        }
    }

    Err(TransportError::UnresolvableAddress(format!(
        "no local interface matches {cidr}"
    )))
}

fn resolve_interface(name: &str, port: u16) -> Result<SocketAddr, TransportError> {
    for (iface_name, addr) in local_ip_address::list_afinet_netifas()
        .map_err(|_| TransportError::UnresolvableAddress(name.to_string()))?
    {
        if iface_name == name {
            return Ok(SocketAddr::new(addr, port));
        }
    }
    Err(TransportError::UnresolvableAddress(format!(
        "no such interface: {name}"
    )))
}
