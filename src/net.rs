use std::io::{self, Read, Write};
use std::net::{self, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};

use log::info;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::{AddrFamily, Scheme, ServerConfig};
use crate::error::{Error, Result};

/// A connected, non-blocking TCP socket.
#[derive(Debug)]
pub struct TcpStream {
    inner: net::TcpStream,
}

impl TcpStream {
    pub fn from_std(stream: net::TcpStream) -> io::Result<TcpStream> {
        stream.set_nonblocking(true)?;

        Ok(TcpStream { inner: stream })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Read for &TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Write for &TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.inner).flush()
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// A bound, listening, non-blocking TCP socket.
#[derive(Debug)]
pub struct TcpListener {
    inner: net::TcpListener,
}

impl TcpListener {
    /// Accept one pending connection; the accepted stream is switched to
    /// non-blocking mode. `WouldBlock` means the backlog is drained.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.inner.accept()?;

        Ok((TcpStream::from_std(stream)?, addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// Creates the listening sockets for `config`.
///
/// The configured host is resolved with the configured family; an empty
/// host binds the wildcard address and an unset port falls back to the
/// scheme's well-known port. One socket is created per resolved address
/// (multiple sockets are common for mixed IPv4/IPv6 names), with
/// SO_REUSEADDR set, IPv4-mapped addresses disabled on IPv6 sockets, and
/// non-blocking mode enabled before `listen`.
pub fn bind_sockets(config: &ServerConfig) -> Result<Vec<TcpListener>> {
    let port = config.port.unwrap_or_else(|| port_for_scheme(config.scheme));
    let addrs = resolve_addrs(&config.host, port, config.family)?;

    let mut listeners = Vec::with_capacity(addrs.len());

    for addr in addrs {
        info!("binding socket for {}", addr);

        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(Error::Bind)?;

        socket.set_cloexec(true).map_err(Error::Bind)?;
        socket.set_reuse_address(true).map_err(Error::Bind)?;

        if addr.is_ipv6() {
            // Always disable IPv4-mapped addresses so the wildcard v4 and
            // v6 addresses can be bound side by side.
            socket.set_only_v6(true).map_err(Error::Bind)?;
        }

        socket.set_nonblocking(true).map_err(Error::Bind)?;
        socket.bind(&addr.into()).map_err(Error::Bind)?;
        socket.listen(config.backlog).map_err(Error::Bind)?;

        info!("server listening on {} with a backlog of {}", addr, config.backlog);

        listeners.push(TcpListener {
            inner: socket.into(),
        });
    }

    Ok(listeners)
}

fn port_for_scheme(scheme: Scheme) -> u16 {
    match scheme {
        Scheme::Http => 80,
        Scheme::Https => 443,
    }
}

fn resolve_addrs(host: &str, port: u16, family: AddrFamily) -> Result<Vec<SocketAddr>> {
    let mut addrs: Vec<SocketAddr> = if host.is_empty() {
        match family {
            AddrFamily::Inet => vec![SocketAddr::from(([0, 0, 0, 0], port))],
            AddrFamily::Inet6 => vec![SocketAddr::from(([0u16; 8], port))],
            AddrFamily::Unspec => vec![
                SocketAddr::from(([0u16; 8], port)),
                SocketAddr::from(([0, 0, 0, 0], port)),
            ],
        }
    } else {
        (host, port)
            .to_socket_addrs()
            .map_err(Error::Bind)?
            .filter(|addr| match family {
                AddrFamily::Inet => addr.is_ipv4(),
                AddrFamily::Inet6 => addr.is_ipv6(),
                AddrFamily::Unspec => true,
            })
            .collect()
    };

    // Resolution may repeat an address in non-adjacent entries; binding
    // it twice would fail with AddrInUse.
    addrs.sort_unstable();
    addrs.dedup();

    if addrs.is_empty() {
        return Err(Error::Bind(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no addresses resolved for {}:{}", host, port),
        )));
    }

    Ok(addrs)
}
