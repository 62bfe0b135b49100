//! Local address selection for content URLs.

use std::net::{IpAddr, SocketAddr, UdpSocket};

use cast_core::{CastError, CastResult};

use crate::device::CONTROL_PORT;

/// Address the device should use to reach this host.
///
/// A configured override wins. Otherwise a UDP socket is "connected" towards
/// the device and its chosen source address is used; no packet is sent.
pub fn detect_local_ip(configured: Option<IpAddr>, device: IpAddr) -> CastResult<IpAddr> {
    if let Some(ip) = configured {
        return Ok(ip);
    }

    let bind: SocketAddr = if device.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind)?;
    socket.connect(SocketAddr::new(device, CONTROL_PORT))?;
    let ip = socket.local_addr()?.ip();

    if ip.is_unspecified() {
        return Err(CastError::Other(format!("no route to device {device}")));
    }
    tracing::debug!("advertising local address {} to {}", ip, device);
    Ok(ip)
}
