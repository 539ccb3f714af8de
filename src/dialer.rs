//! Outbound connection capability, injected at `Server` construction so tests can
//! substitute in-memory transports instead of touching real sockets. DNS
//! resolution strategy is entirely the dialer's concern.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket, lookup_host};

/// Anything the relay can read from and write to in place of a real TCP socket.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

#[async_trait]
pub trait Dialer: Send + Sync {
	/// Dial a TCP connection to `addr` (a `host:port` dial string).
	async fn dial_tcp(&self, addr: &str) -> io::Result<Box<dyn AsyncStream>>;

	/// Resolve `remote` (a `host:port` dial string) and bind+connect a UDP
	/// socket to it, optionally pinned to `local`. Resolution is this method's
	/// concern, not the caller's.
	async fn dial_udp(&self, local: Option<SocketAddr>, remote: &str) -> io::Result<UdpSocket>;
}

pub struct TokioDialer;

#[async_trait]
impl Dialer for TokioDialer {
	async fn dial_tcp(&self, addr: &str) -> io::Result<Box<dyn AsyncStream>> {
		let s = TcpStream::connect(addr).await?;
		Ok(Box::new(s))
	}

	async fn dial_udp(&self, local: Option<SocketAddr>, remote: &str) -> io::Result<UdpSocket> {
		let remote = lookup_host(remote)
			.await?
			.next()
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved"))?;
		let bind_addr = local.unwrap_or_else(|| unspecified_for(remote));
		let socket = UdpSocket::bind(bind_addr).await?;
		socket.connect(remote).await?;
		Ok(socket)
	}
}

fn unspecified_for(remote: SocketAddr) -> SocketAddr {
	match remote.ip() {
		IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
		IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
	}
}
