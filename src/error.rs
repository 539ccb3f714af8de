use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	#[error("config: {0}")]
	Config(String),

	#[error("network: {0}")]
	Network(#[from] std::io::Error),

	#[error("protocol: {0}")]
	Protocol(String),

	#[error("auth rejected: {0}")]
	Auth(String),

	/// UDP outbound dial failed because the chosen local address is already in
	/// use; the caller drops the datagram silently rather than surfacing this
	/// further.
	#[error("transient race on flow")]
	TransientRace,
}

impl Error {
	pub fn is_transient_race(&self) -> bool {
		matches!(self, Error::TransientRace)
	}
}
