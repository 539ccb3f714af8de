//! `Server`: the embedder-facing lifecycle API, plus the `Shared` state both the
//! TCP and UDP runners hold an `Arc` to, and the runner-group/shutdown wiring.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::info;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;

use crate::authman::Authman;
use crate::dialer::{Dialer, TokioDialer};
use crate::error::{Error, Result};
use crate::udp::{FlowKey, FlowSlot};

pub(crate) struct Shared {
	pub password: Vec<u8>,
	pub tcp_timeout: Duration,
	pub udp_timeout: Duration,
	pub authman: Option<Arc<dyn Authman>>,
	pub dialer: Arc<dyn Dialer>,
	pub udp_exchanges: DashMap<FlowKey, FlowSlot>,
	pub udp_src: DashMap<FlowKey, SocketAddr>,
}

impl Shared {
	pub(crate) fn for_test(
		password: Vec<u8>,
		tcp_timeout: Duration,
		udp_timeout: Duration,
		authman: Option<Arc<dyn Authman>>,
		dialer: Arc<dyn Dialer>,
	) -> Self {
		Shared {
			password,
			tcp_timeout,
			udp_timeout,
			authman,
			dialer,
			udp_exchanges: DashMap::new(),
			udp_src: DashMap::new(),
		}
	}
}

/// The server side of the relay. Stateless across restarts: everything it holds
/// lives only for the process lifetime between `listen_and_serve` and `shutdown`.
pub struct Server {
	listen_address: String,
	shared: Arc<Shared>,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
}

impl Server {
	pub fn new(
		listen_address: impl Into<String>,
		password: impl Into<Vec<u8>>,
		tcp_timeout: Duration,
		udp_timeout: Duration,
	) -> Self {
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		Server {
			listen_address: listen_address.into(),
			shared: Arc::new(Shared::for_test(
				password.into(),
				tcp_timeout,
				udp_timeout,
				None,
				Arc::new(TokioDialer),
			)),
			shutdown_tx,
			shutdown_rx,
		}
	}

	/// Must be called before [`Server::listen_and_serve`].
	pub fn set_authman(&mut self, authman: Arc<dyn Authman>) {
		let shared = Arc::get_mut(&mut self.shared)
			.expect("set_authman must be called before listen_and_serve");
		shared.authman = Some(authman);
	}

	/// Must be called before [`Server::listen_and_serve`]. Defaults to a
	/// Tokio-backed dialer; mainly useful for tests.
	pub fn set_dialer(&mut self, dialer: Arc<dyn Dialer>) {
		let shared = Arc::get_mut(&mut self.shared)
			.expect("set_dialer must be called before listen_and_serve");
		shared.dialer = dialer;
	}

	/// Bind the TCP and UDP endpoints and run both runner loops concurrently.
	/// Blocks until either listener exits (error, or `shutdown()` was called).
	pub async fn listen_and_serve(&mut self) -> Result<()> {
		let addr: SocketAddr = self
			.listen_address
			.parse()
			.map_err(|_| Error::Config(format!("invalid listen address: {}", self.listen_address)))?;

		let tcp_listener = TcpListener::bind(addr).await?;
		let udp_socket = Arc::new(UdpSocket::bind(addr).await?);
		info!("listening on {} (tcp+udp)", addr);

		let tcp_shared = self.shared.clone();
		let mut tcp_shutdown = self.shutdown_rx.clone();
		let tcp_task =
			tokio::spawn(async move { crate::tcp::accept_loop(tcp_shared, tcp_listener, &mut tcp_shutdown).await });

		let udp_shared = self.shared.clone();
		let mut udp_shutdown = self.shutdown_rx.clone();
		let udp_task = tokio::spawn(
			async move { crate::udp::run_listener(udp_shared, udp_socket, &mut udp_shutdown).await },
		);

		let result = tokio::select! {
			r = tcp_task => join_result(r),
			r = udp_task => join_result(r),
		};

		self.shutdown();
		result
	}

	/// Close both listeners. Idempotent: safe to call multiple times, and safe
	/// to call before `listen_and_serve` (the runners will see the shutdown
	/// signal as soon as they start).
	pub fn shutdown(&self) {
		let _ = self.shutdown_tx.send(true);
	}
}

fn join_result(r: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
	match r {
		Ok(inner) => inner,
		Err(e) => Err(Error::Network(std::io::Error::other(e))),
	}
}
