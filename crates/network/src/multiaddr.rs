//! Conversion of provider multiaddrs into HTTP base URLs.

use crate::error::{NetworkError, Result};

/// Turns `/ip4/1.2.3.4/tcp/8080/http` style addresses into
/// `http://1.2.3.4:8080`. Supported hosts are `ip4`, `ip6`, `dns`, `dns4` and
/// `dns6`. The scheme comes from `http`, `https` or `tls/http`. Anything after
/// the scheme (for example `/p2p/<id>`) is ignored.
pub fn multiaddr_to_url(addr: &str) -> Result<String> {
    let unsupported = || NetworkError::invalid_request(format!("unsupported multiaddr '{addr}'"));
    let mut parts = addr.strip_prefix('/').ok_or_else(unsupported)?.split('/');

    let host = match (parts.next(), parts.next()) {
        (Some("ip4"), Some(ip)) => ip.to_string(),
        (Some("ip6"), Some(ip)) => format!("[{ip}]"),
        (Some("dns" | "dns4" | "dns6"), Some(name)) => name.to_string(),
        _ => return Err(unsupported()),
    };
    let port = match (parts.next(), parts.next()) {
        (Some("tcp"), Some(port)) => port.parse::<u16>().map_err(|_| unsupported())?,
        _ => return Err(unsupported()),
    };
    let scheme = match (parts.next(), parts.next()) {
        (Some("http"), _) => "http",
        (Some("https"), _) => "https",
        (Some("tls"), Some("http")) => "https",
        _ => return Err(unsupported()),
    };

    Ok(format!("{scheme}://{host}:{port}"))
}
