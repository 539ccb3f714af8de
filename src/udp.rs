//! UDP demultiplexer: a per-(client, destination) flow table with source-port
//! pinning, atomic get-or-insert, and per-flow reader tasks whose read deadline is
//! the only expiry mechanism.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use log::{debug, error, info};
use tokio::net::UdpSocket;
use tokio::sync::{Notify, watch};
use tokio::time::timeout;

use crate::addr::TargetAddr;
use crate::authman::{Internet, Protocol};
use crate::error::{Error, Result};
use crate::packet;
use crate::server::Shared;

pub(crate) type FlowKey = (SocketAddr, TargetAddr);

pub(crate) struct UdpExchange {
	client_addr: SocketAddr,
	socket: UdpSocket,
	internet: Option<Box<dyn Internet>>,
}

/// A flow table slot. `Pending` reserves the key for the task dialing out;
/// any other datagram for the same key waits on the `Notify` instead of
/// dialing a second outbound socket, then re-checks the slot once woken.
pub(crate) enum FlowSlot {
	Pending(Arc<Notify>),
	Ready(Arc<UdpExchange>),
}

/// Receive datagrams until the shutdown signal fires, dispatching each to its
/// own task so one slow dial can't stall the listener's recv loop.
pub(crate) async fn run_listener(
	shared: Arc<Shared>,
	socket: Arc<UdpSocket>,
	shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
	let mut buf = vec![0u8; packet::MAX_DATAGRAM];
	loop {
		tokio::select! {
			_ = shutdown.changed() => {
				if *shutdown.borrow() {
					return Ok(());
				}
			}
			res = socket.recv_from(&mut buf) => {
				let (n, client_addr) = res?;
				let datagram = buf[..n].to_vec();
				let shared = shared.clone();
				let socket = socket.clone();
				tokio::spawn(handle_datagram(shared, socket, client_addr, datagram));
			}
		}
	}
}

/// Handle one inbound datagram from the UDP listener: look up or create the
/// exchange for its (client, destination) pair and forward the payload.
pub(crate) async fn handle_datagram(
	shared: Arc<Shared>,
	listener: Arc<UdpSocket>,
	client_addr: SocketAddr,
	datagram: Vec<u8>,
) {
	match route_datagram(&shared, &listener, client_addr, &datagram).await {
		Ok(()) => {}
		Err(e) if e.is_transient_race() => {
			debug!("{}: dropped datagram on transient flow race", client_addr);
		}
		Err(e) => {
			debug!("{}: dropped datagram: {}", client_addr, e);
		}
	}
}

async fn route_datagram(
	shared: &Arc<Shared>,
	listener: &Arc<UdpSocket>,
	client_addr: SocketAddr,
	datagram: &[u8],
) -> Result<()> {
	let (dst, data) = packet::decrypt(&shared.password, datagram)?;
	let key: FlowKey = (client_addr, dst.clone());

	loop {
		enum Step {
			Send(Arc<UdpExchange>),
			Wait(Arc<Notify>),
			Own(Arc<Notify>),
		}

		let step = match shared.udp_exchanges.entry(key.clone()) {
			Entry::Occupied(e) => match e.get() {
				FlowSlot::Ready(exchange) => Step::Send(exchange.clone()),
				FlowSlot::Pending(notify) => Step::Wait(notify.clone()),
			},
			Entry::Vacant(v) => {
				let notify = Arc::new(Notify::new());
				v.insert(FlowSlot::Pending(notify.clone()));
				Step::Own(notify)
			}
		};

		match step {
			Step::Send(exchange) => return send_on_exchange(shared, &exchange, &data).await,
			Step::Wait(notify) => {
				notify.notified().await;
				continue;
			}
			Step::Own(notify) => {
				return create_exchange(shared, listener, client_addr, dst, key, data, notify).await;
			}
		}
	}
}

async fn send_on_exchange(shared: &Shared, exchange: &UdpExchange, data: &[u8]) -> Result<()> {
	let payload = if shared.authman.is_some() {
		packet::strip_trailing_token(data).0
	} else {
		data
	};
	let n = exchange.socket.send(payload).await?;
	if let Some(internet) = &exchange.internet {
		internet.udp_egress(n).await;
	}
	Ok(())
}

/// Dial the outbound socket for a newly reserved flow key and, on success,
/// settle the slot to `Ready` and spawn its reader task. The caller has
/// already reserved `key` with a `Pending(notify)` slot; every exit path here
/// must leave the table in a consistent state (either `Ready` or removed
/// back to vacant) and wake `notify` so any datagram that queued up behind
/// this one re-checks the slot instead of dialing a second outbound socket.
async fn create_exchange(
	shared: &Arc<Shared>,
	listener: &Arc<UdpSocket>,
	client_addr: SocketAddr,
	dst: TargetAddr,
	key: FlowKey,
	data: Vec<u8>,
	notify: Arc<Notify>,
) -> Result<()> {
	let settle_failure = |shared: &Arc<Shared>, key: &FlowKey, notify: &Notify| {
		shared.udp_exchanges.remove(key);
		notify.notify_waiters();
	};

	let (payload, token) = if shared.authman.is_some() {
		let (p, t) = packet::strip_trailing_token(&data);
		(p.to_vec(), t.map(|t| t.to_vec()))
	} else {
		(data, None)
	};

	let internet = if let Some(authman) = &shared.authman {
		let internet = match authman
			.verify_token(
				token.as_deref().unwrap_or(&[]),
				Protocol::Udp,
				dst.atyp(),
				&dst.dial_string(),
				Some(&payload),
			)
			.await
		{
			Ok(i) => i,
			Err(e) => {
				settle_failure(shared, &key, &notify);
				return Err(e);
			}
		};
		Some(internet)
	} else {
		None
	};

	let pinned_local = shared.udp_src.get(&key).map(|r| *r);
	let dial_string = dst.dial_string();
	let socket = match shared.dialer.dial_udp(pinned_local, &dial_string).await {
		Ok(s) => s,
		Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
			if let Some(internet) = internet {
				internet.close().await;
			}
			settle_failure(shared, &key, &notify);
			return Err(Error::TransientRace);
		}
		Err(e) => {
			if let Some(internet) = internet {
				internet.close().await;
			}
			settle_failure(shared, &key, &notify);
			return Err(Error::Network(e));
		}
	};

	if pinned_local.is_none() {
		if let Ok(local_addr) = socket.local_addr() {
			shared.udp_src.insert(key.clone(), local_addr);
		}
	}

	if let Err(e) = socket.send(&payload).await {
		if let Some(internet) = internet {
			internet.close().await;
		}
		settle_failure(shared, &key, &notify);
		return Err(Error::Network(e));
	}
	if let Some(internet) = &internet {
		internet.udp_egress(payload.len()).await;
	}

	let exchange = Arc::new(UdpExchange {
		client_addr,
		socket,
		internet,
	});

	shared
		.udp_exchanges
		.insert(key.clone(), FlowSlot::Ready(exchange.clone()));
	notify.notify_waiters();

	info!("{} -> {} (new udp exchange)", client_addr, dst);

	let shared = Arc::clone(shared);
	let listener = Arc::clone(listener);
	tokio::spawn(async move {
		reader_loop(shared, listener, key, exchange, dst).await;
	});

	Ok(())
}

/// Pump datagrams from the exchange's outbound socket back to the client until
/// the read deadline fires or an error occurs, then tear the exchange down.
async fn reader_loop(
	shared: Arc<Shared>,
	listener: Arc<UdpSocket>,
	key: FlowKey,
	exchange: Arc<UdpExchange>,
	dst: TargetAddr,
) {
	let mut buf = vec![0u8; packet::MAX_DATAGRAM];
	loop {
		let read = if shared.udp_timeout.is_zero() {
			exchange.socket.recv(&mut buf).await
		} else {
			match timeout(shared.udp_timeout, exchange.socket.recv(&mut buf)).await {
				Ok(r) => r,
				Err(_) => {
					debug!("{}: udp exchange idle timeout", exchange.client_addr);
					break;
				}
			}
		};

		let n = match read {
			Ok(n) => n,
			Err(e) => {
				debug!("{}: udp exchange read error: {}", exchange.client_addr, e);
				break;
			}
		};

		let sealed = packet::encrypt(&shared.password, &dst, &buf[..n]);
		if let Err(e) = listener.send_to(&sealed, exchange.client_addr).await {
			error!("{}: failed writing to client: {}", exchange.client_addr, e);
			break;
		}
		if let Some(internet) = &exchange.internet {
			internet.udp_egress(n).await;
		}
	}

	shared.udp_exchanges.remove(&key);
	if let Some(internet) = &exchange.internet {
		internet.close().await;
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::authman::NoopAuthman;
	use crate::dialer::TokioDialer;
	use std::net::Ipv4Addr;

	fn test_shared() -> Arc<Shared> {
		Arc::new(Shared::for_test(
			b"pw".to_vec(),
			Duration::ZERO,
			Duration::from_millis(200),
			None,
			Arc::new(TokioDialer),
		))
	}

	#[tokio::test]
	async fn two_datagrams_share_one_exchange() {
		let shared = test_shared();
		let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let echo_addr = echo.local_addr().unwrap();
		tokio::spawn(async move {
			let mut buf = [0u8; 1024];
			loop {
				let (n, from) = match echo.recv_from(&mut buf).await {
					Ok(v) => v,
					Err(_) => break,
				};
				let _ = echo.send_to(&buf[..n], from).await;
			}
		});

		let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
		let client_addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
		let dst = TargetAddr::V4(
			match echo_addr.ip() {
				std::net::IpAddr::V4(v) => v,
				_ => unreachable!(),
			},
			echo_addr.port(),
		);

		let d1 = packet::encrypt(b"pw", &dst, b"one");
		handle_datagram(shared.clone(), listener.clone(), client_addr, d1).await;
		assert_eq!(shared.udp_exchanges.len(), 1);

		let d2 = packet::encrypt(b"pw", &dst, b"two");
		handle_datagram(shared.clone(), listener.clone(), client_addr, d2).await;
		assert_eq!(shared.udp_exchanges.len(), 1);

		let key: FlowKey = (client_addr, dst.clone());
		assert!(shared.udp_src.get(&key).is_some());
	}

	#[tokio::test]
	async fn concurrent_datagrams_for_a_new_flow_are_both_delivered() {
		let shared = test_shared();
		let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let echo_addr = echo.local_addr().unwrap();
		let received = Arc::new(tokio::sync::Mutex::new(0usize));
		let received2 = received.clone();
		tokio::spawn(async move {
			let mut buf = [0u8; 1024];
			loop {
				let (n, from) = match echo.recv_from(&mut buf).await {
					Ok(v) => v,
					Err(_) => break,
				};
				*received2.lock().await += 1;
				let _ = echo.send_to(&buf[..n], from).await;
			}
		});

		let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
		let client_addr: SocketAddr = "10.0.0.9:9000".parse().unwrap();
		let dst = TargetAddr::V4(
			match echo_addr.ip() {
				std::net::IpAddr::V4(v) => v,
				_ => unreachable!(),
			},
			echo_addr.port(),
		);

		let d1 = packet::encrypt(b"pw", &dst, b"one");
		let d2 = packet::encrypt(b"pw", &dst, b"two");

		let (r1, r2) = tokio::join!(
			route_datagram(&shared, &listener, client_addr, &d1),
			route_datagram(&shared, &listener, client_addr, &d2),
		);
		r1.unwrap();
		r2.unwrap();

		assert_eq!(shared.udp_exchanges.len(), 1);
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(*received.lock().await, 2);
	}

	#[tokio::test]
	async fn authman_rejection_creates_no_exchange() {
		let shared = Arc::new(Shared::for_test(
			b"pw".to_vec(),
			Duration::ZERO,
			Duration::ZERO,
			Some(Arc::new(crate::authman::DenyAllAuthman)),
			Arc::new(TokioDialer),
		));
		let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
		let client_addr: SocketAddr = "10.0.0.2:6000".parse().unwrap();
		let dst = TargetAddr::V4(Ipv4Addr::new(127, 0, 0, 1), 9);

		let datagram = packet::encrypt(b"pw", &dst, b"x");
		handle_datagram(shared.clone(), listener, client_addr, datagram).await;
		assert_eq!(shared.udp_exchanges.len(), 0);
	}

	#[tokio::test]
	async fn noop_authman_allows_exchange_creation() {
		let shared = Arc::new(Shared::for_test(
			b"pw".to_vec(),
			Duration::ZERO,
			Duration::from_millis(50),
			Some(Arc::new(NoopAuthman)),
			Arc::new(TokioDialer),
		));
		let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let echo_addr = echo.local_addr().unwrap();
		tokio::spawn(async move {
			let mut buf = [0u8; 1024];
			if let Ok((n, from)) = echo.recv_from(&mut buf).await {
				let _ = echo.send_to(&buf[..n], from).await;
			}
		});

		let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
		let client_addr: SocketAddr = "10.0.0.3:7000".parse().unwrap();
		let dst = TargetAddr::V4(
			match echo_addr.ip() {
				std::net::IpAddr::V4(v) => v,
				_ => unreachable!(),
			},
			echo_addr.port(),
		);

		let mut data = b"hello".to_vec();
		let token = b"tok";
		data.extend_from_slice(token);
		data.extend_from_slice(&(token.len() as u16).to_be_bytes());
		let datagram = packet::encrypt(b"pw", &dst, &data);

		handle_datagram(shared.clone(), listener, client_addr, datagram).await;
		assert_eq!(shared.udp_exchanges.len(), 1);
	}
}
