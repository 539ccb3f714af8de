//! The `Authman` plugin interface: an optional external authorizer/accountant the
//! core calls out to. Specified here only as a trait, any concrete
//! implementation (license checks, quota enforcement, billing) lives outside this
//! crate.

use async_trait::async_trait;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
	Tcp,
	Udp,
}

/// An accounting handle for one live connection or UDP exchange.
#[async_trait]
pub trait Internet: Send + Sync {
	async fn tcp_egress(&self, _n: usize) {}
	async fn udp_egress(&self, _n: usize) {}
	async fn close(&self);
}

/// The authorization/accounting plugin. Called once per TCP connection and once
/// per newly-created UDP exchange.
#[async_trait]
pub trait Authman: Send + Sync {
	async fn verify_token(
		&self,
		token: &[u8],
		proto: Protocol,
		atyp: u8,
		address: &str,
		extra: Option<&[u8]>,
	) -> Result<Box<dyn Internet>>;
}

/// A zero-cost stand-in used when no Authman is configured: verification always
/// succeeds and accounting is a no-op.
pub struct NoopAuthman;

struct NoopInternet;

#[async_trait]
impl Internet for NoopInternet {
	async fn close(&self) {}
}

#[async_trait]
impl Authman for NoopAuthman {
	async fn verify_token(
		&self,
		_token: &[u8],
		_proto: Protocol,
		_atyp: u8,
		_address: &str,
		_extra: Option<&[u8]>,
	) -> Result<Box<dyn Internet>> {
		Ok(Box::new(NoopInternet))
	}
}

/// An Authman that always rejects, used in tests for the auth-failure path.
#[cfg(test)]
pub struct DenyAllAuthman;

#[cfg(test)]
#[async_trait]
impl Authman for DenyAllAuthman {
	async fn verify_token(
		&self,
		_token: &[u8],
		_proto: Protocol,
		_atyp: u8,
		_address: &str,
		_extra: Option<&[u8]>,
	) -> Result<Box<dyn Internet>> {
		Err(Error::Auth("token rejected".into()))
	}
}
