//! Listener sockets shared by the edge, control and metrics servers.
//!
//! Listeners are created through socket2 so SO_REUSEADDR/SO_REUSEPORT can be
//! set before binding, allowing several edge processes to share a port.

use std::net::{SocketAddr, ToSocketAddrs};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

const LISTEN_BACKLOG: i32 = 1024;

/// Resolve `host:port` and bind a reusable listener on the first address.
pub fn bind_listener(host: &str, port: u16) -> std::io::Result<TcpListener> {
    let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("'{host}' did not resolve to any address"),
        )
    })?;
    create_reusable_listener(addr)
}

/// Create a TCP listener with SO_REUSEADDR, and SO_REUSEPORT where available.
pub fn create_reusable_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    set_reuse_port(&socket)?;
    socket.set_nonblocking(true)?;

    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "ios"))]
fn set_reuse_port(socket: &Socket) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let optval: libc::c_int = 1;
    // SAFETY: the fd is owned by `socket` and stays open for the call; optval
    // outlives the call and its size is passed alongside it.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of_val(&optval) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
fn set_reuse_port(_socket: &Socket) -> std::io::Result<()> {
    Ok(())
}
