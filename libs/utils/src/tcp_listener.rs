use std::net::TcpListener;

use anyhow::Context;

/// Bind a std TCP listener suitable for handing to `hyper::Server::from_tcp`.
pub fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    let listener =
        TcpListener::bind(addr).with_context(|| format!("failed to bind to address {addr}"))?;
    // hyper's from_tcp requires the listener in non-blocking mode.
    listener.set_nonblocking(true)?;
    Ok(listener)
}
