//! TCP relay: handshake, outbound dial, and the bidirectional framed copy with
//! rolling deadlines.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use std::sync::Arc;

use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::addr::TargetAddr;
use crate::authman::{Internet, Protocol};
use crate::crypto::{self, KeyBytes, Nonce};
use crate::error::{Error, Result};
use crate::framer::{self, MAX_PAYLOAD};
use crate::server::Shared;

/// Accept connections until the shutdown signal fires, spawning one task per
/// connection. A `tokio::select!` races `listener.accept()` against
/// `shutdown.changed()` so a shutdown signal unblocks the loop without closing
/// the listener out from under an in-flight accept.
pub(crate) async fn accept_loop(
	shared: Arc<Shared>,
	listener: TcpListener,
	shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
	loop {
		tokio::select! {
			_ = shutdown.changed() => {
				if *shutdown.borrow() {
					return Ok(());
				}
			}
			res = listener.accept() => {
				let (sock, peer) = res?;
				let shared = shared.clone();
				tokio::spawn(handle_connection(shared, sock, peer));
			}
		}
	}
}

/// Run one accepted connection to completion. Never propagates an error to the
/// caller, failures are logged and simply end this connection's task.
pub async fn handle_connection(shared: Arc<Shared>, inbound: TcpStream, peer: SocketAddr) {
	if let Err(e) = run(&shared, inbound, peer).await {
		debug!("{}: connection ended: {}", peer, e);
	}
}

async fn run(shared: &Shared, mut inbound: TcpStream, peer: SocketAddr) -> Result<()> {
	let timeout = shared.tcp_timeout;

	let cn = with_timeout(timeout, framer::read_initial_nonce(&mut inbound)).await??;
	let ck = crypto::derive_key(&shared.password, &cn);

	let (addr_bytes, mut recv_nonce) =
		with_timeout(timeout, framer::read_record(&mut inbound, &ck, cn)).await??;
	let (target, _) = TargetAddr::decode(&addr_bytes)?;

	let internet: Option<Box<dyn Internet>> = if let Some(authman) = &shared.authman {
		let (token, nonce_after_token) =
			with_timeout(timeout, framer::read_record(&mut inbound, &ck, recv_nonce)).await??;
		recv_nonce = nonce_after_token;
		match authman
			.verify_token(&token, Protocol::Tcp, target.atyp(), &target.dial_string(), None)
			.await
		{
			Ok(i) => Some(i),
			Err(e) => {
				debug!("{}: auth rejected for {}: {}", peer, target, e);
				return Err(e);
			}
		}
	} else {
		None
	};

	info!("{} -> {}", peer, target);

	let dial_string = target.dial_string();
	let mut outbound = with_timeout(timeout, shared.dialer.dial_tcp(&dial_string))
		.await?
		.map_err(|e| {
			error!("{}: error dialing {}: {}", peer, target, e);
			Error::Network(e)
		})?;

	let reply_nonce = crypto::random_nonce();
	let send_key = crypto::derive_key(&shared.password, &reply_nonce);
	with_timeout(timeout, framer::write_initial_nonce(&mut inbound, &reply_nonce)).await??;

	let (mut in_read, mut in_write) = tokio::io::split(inbound);
	let (mut out_read, mut out_write) = tokio::io::split(outbound.as_mut());

	let internet_ref = internet.as_deref();

	let result = tokio::select! {
		r = relay_send(&mut out_read, &mut in_write, send_key, reply_nonce, timeout, internet_ref) => r,
		r = relay_receive(&mut in_read, &mut out_write, ck, recv_nonce, timeout, internet_ref) => r,
	};

	if let Some(internet) = &internet {
		internet.close().await;
	}

	result
}

/// server -> client: read plaintext from the outbound socket, frame it onto the
/// inbound socket.
async fn relay_send<R, W>(
	outbound: &mut R,
	inbound: &mut W,
	key: KeyBytes,
	mut nonce: Nonce,
	timeout: Duration,
	internet: Option<&dyn Internet>,
) -> Result<()>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut buf = vec![0u8; MAX_PAYLOAD];
	loop {
		let n = with_timeout(timeout, outbound.read(&mut buf)).await??;
		if n == 0 {
			return Ok(());
		}
		nonce = with_timeout(timeout, framer::write_record(inbound, &buf[..n], &key, nonce)).await??;
		if let Some(internet) = internet {
			internet.tcp_egress(n).await;
		}
	}
}

/// client -> server: read a framed record from the inbound socket, write its
/// plaintext to the outbound socket.
async fn relay_receive<R, W>(
	inbound: &mut R,
	outbound: &mut W,
	key: KeyBytes,
	mut nonce: Nonce,
	timeout: Duration,
	internet: Option<&dyn Internet>,
) -> Result<()>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	loop {
		let (plaintext, new_nonce) =
			with_timeout(timeout, framer::read_record(inbound, &key, nonce)).await??;
		nonce = new_nonce;
		with_timeout(timeout, outbound.write_all(&plaintext)).await??;
		if let Some(internet) = internet {
			internet.tcp_egress(plaintext.len()).await;
		}
	}
}

/// Apply `timeout` to `fut` unless it is zero (disabled). Every I/O operation
/// gets a fresh deadline window, rather than the connection having one
/// deadline for its whole lifetime.
async fn with_timeout<F, T>(timeout: Duration, fut: F) -> Result<T>
where
	F: Future<Output = T>,
{
	if timeout.is_zero() {
		Ok(fut.await)
	} else {
		tokio::time::timeout(timeout, fut)
			.await
			.map_err(|_| Error::Network(std::io::Error::from(std::io::ErrorKind::TimedOut)))
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::authman::DenyAllAuthman;
	use crate::dialer::{AsyncStream, Dialer};
	use async_trait::async_trait;
	use std::net::{IpAddr, Ipv4Addr};
	use std::sync::Arc;
	use tokio::net::{TcpListener, UdpSocket};

	struct EchoDialer;

	#[async_trait]
	impl Dialer for EchoDialer {
		async fn dial_tcp(&self, addr: &str) -> std::io::Result<Box<dyn AsyncStream>> {
			Ok(Box::new(TcpStream::connect(addr).await?))
		}
		async fn dial_udp(&self, _local: Option<SocketAddr>, _remote: &str) -> std::io::Result<UdpSocket> {
			UdpSocket::bind("127.0.0.1:0").await
		}
	}

	async fn echo_server() -> SocketAddr {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			while let Ok((mut sock, _)) = listener.accept().await {
				tokio::spawn(async move {
					let (mut r, mut w) = sock.split();
					let _ = tokio::io::copy(&mut r, &mut w).await;
				});
			}
		});
		addr
	}

	fn shared_with(authman: Option<Arc<dyn crate::authman::Authman>>) -> Arc<Shared> {
		Arc::new(Shared::for_test(
			b"pw".to_vec(),
			Duration::ZERO,
			Duration::ZERO,
			authman,
			Arc::new(EchoDialer),
		))
	}

	#[tokio::test]
	async fn full_handshake_and_relay_roundtrip() {
		let echo_addr = echo_server().await;
		let shared = shared_with(None);

		let relay_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let relay_addr = relay_listener.local_addr().unwrap();
		let shared2 = shared.clone();
		tokio::spawn(async move {
			let (sock, peer) = relay_listener.accept().await.unwrap();
			handle_connection(shared2, sock, peer).await;
		});

		let mut client = TcpStream::connect(relay_addr).await.unwrap();
		let cn = [0u8; 12];
		let ck = crypto::derive_key(b"pw", &cn);
		client.write_all(&cn).await.unwrap();

		let target = TargetAddr::V4(
			match echo_addr.ip() {
				IpAddr::V4(v4) => v4,
				_ => unreachable!(),
			},
			echo_addr.port(),
		);
		let mut addr_bytes = bytes::BytesMut::new();
		target.encode(&mut addr_bytes);
		let nonce = framer::write_record(&mut client, &addr_bytes, &ck, cn).await.unwrap();

		let reply_nonce = framer::read_initial_nonce(&mut client).await.unwrap();
		let sk = crypto::derive_key(b"pw", &reply_nonce);

		let (mut send_nonce, recv_nonce) = (nonce, reply_nonce);
		send_nonce = framer::write_record(&mut client, b"ping", &ck, send_nonce).await.unwrap();
		let (echoed, _) = framer::read_record(&mut client, &sk, recv_nonce).await.unwrap();
		assert_eq!(echoed, b"ping");
		let _ = send_nonce;
	}

	#[tokio::test]
	async fn auth_rejection_closes_without_dialing() {
		let shared = shared_with(Some(Arc::new(DenyAllAuthman)));

		let relay_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let relay_addr = relay_listener.local_addr().unwrap();
		let shared2 = shared.clone();
		tokio::spawn(async move {
			let (sock, peer) = relay_listener.accept().await.unwrap();
			handle_connection(shared2, sock, peer).await;
		});

		let mut client = TcpStream::connect(relay_addr).await.unwrap();
		let cn = [0u8; 12];
		let ck = crypto::derive_key(b"pw", &cn);
		client.write_all(&cn).await.unwrap();

		let target = TargetAddr::V4(Ipv4Addr::new(127, 0, 0, 1), 80);
		let mut addr_bytes = bytes::BytesMut::new();
		target.encode(&mut addr_bytes);
		let nonce = framer::write_record(&mut client, &addr_bytes, &ck, cn).await.unwrap();
		framer::write_record(&mut client, b"bad", &ck, nonce).await.unwrap();

		// The server closes without ever writing a reply nonce.
		let mut buf = [0u8; 1];
		let n = client.read(&mut buf).await.unwrap();
		assert_eq!(n, 0);
	}
}
