use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs, UdpSocket};

use tracing::debug;

/// The address put into session URLs: the configured host, else the primary
/// LAN address, else whatever the hostname resolves to, else loopback.
#[must_use]
pub fn advertise_host(configured: Option<&str>) -> String {
    if let Some(host) = configured.map(str::trim).filter(|h| !h.is_empty()) {
        return host.to_string();
    }

    let ip = primary_address()
        .or_else(hostname_address)
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    debug!(%ip, "Detected advertise address");
    ip.to_string()
}

/// Address of the interface that routes to the internet. No packet is sent;
/// connecting a UDP socket only selects the route.
fn primary_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}

fn hostname_address() -> Option<IpAddr> {
    let name = hostname::get().ok()?.into_string().ok()?;
    (name.as_str(), 0)
        .to_socket_addrs()
        .ok()?
        .map(|addr| addr.ip())
        .find(|ip| ip.is_ipv4() && !ip.is_loopback())
}
