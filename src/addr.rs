//! SOCKS-style address triple: `atyp(1) || host || port(2, big-endian)`.
//!
//! atyp 1 = IPv4 (4-byte host), 3 = domain (1-byte length prefix + host), 4 = IPv6
//! (16-byte host).

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

const ATYP_V4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_V6: u8 = 4;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TargetAddr {
	V4(Ipv4Addr, u16),
	Domain(String, u16),
	V6(Ipv6Addr, u16),
}

impl TargetAddr {
	pub fn port(&self) -> u16 {
		match self {
			TargetAddr::V4(_, p) | TargetAddr::Domain(_, p) | TargetAddr::V6(_, p) => *p,
		}
	}

	pub fn atyp(&self) -> u8 {
		match self {
			TargetAddr::V4(..) => ATYP_V4,
			TargetAddr::Domain(..) => ATYP_DOMAIN,
			TargetAddr::V6(..) => ATYP_V6,
		}
	}

	/// The string a dialer can resolve and connect to.
	pub fn dial_string(&self) -> String {
		match self {
			TargetAddr::V4(ip, port) => format!("{}:{}", ip, port),
			TargetAddr::Domain(host, port) => format!("{}:{}", host, port),
			TargetAddr::V6(ip, port) => format!("[{}]:{}", ip, port),
		}
	}

	pub fn encoded_len(&self) -> usize {
		1 + match self {
			TargetAddr::V4(..) => 4,
			TargetAddr::Domain(host, _) => 1 + host.len(),
			TargetAddr::V6(..) => 16,
		} + 2
	}

	pub fn encode(&self, buf: &mut impl BufMut) {
		buf.put_u8(self.atyp());
		match self {
			TargetAddr::V4(ip, _) => buf.put_slice(&ip.octets()),
			TargetAddr::Domain(host, _) => {
				buf.put_u8(host.len() as u8);
				buf.put_slice(host.as_bytes());
			}
			TargetAddr::V6(ip, _) => buf.put_slice(&ip.octets()),
		}
		buf.put_u16(self.port());
	}

	/// Decode a triple from the front of `buf`, advancing past it. Returns the
	/// trailing bytes as the caller's user data.
	pub fn decode(buf: &[u8]) -> Result<(TargetAddr, &[u8])> {
		if buf.is_empty() {
			return Err(Error::Protocol("empty address triple".into()));
		}
		let atyp = buf[0];
		let mut rest = &buf[1..];
		let addr = match atyp {
			ATYP_V4 => {
				if rest.len() < 4 {
					return Err(Error::Protocol("short ipv4 address".into()));
				}
				let mut octets = [0u8; 4];
				octets.copy_from_slice(&rest[..4]);
				rest.advance(4);
				TargetAddr::V4(Ipv4Addr::from(octets), 0)
			}
			ATYP_DOMAIN => {
				if rest.is_empty() {
					return Err(Error::Protocol("missing domain length".into()));
				}
				let len = rest[0] as usize;
				rest.advance(1);
				if rest.len() < len {
					return Err(Error::Protocol("short domain".into()));
				}
				let host = std::str::from_utf8(&rest[..len])
					.map_err(|_| Error::Protocol("invalid utf8 in domain".into()))?
					.to_owned();
				rest.advance(len);
				TargetAddr::Domain(host, 0)
			}
			ATYP_V6 => {
				if rest.len() < 16 {
					return Err(Error::Protocol("short ipv6 address".into()));
				}
				let mut octets = [0u8; 16];
				octets.copy_from_slice(&rest[..16]);
				rest.advance(16);
				TargetAddr::V6(Ipv6Addr::from(octets), 0)
			}
			other => return Err(Error::Protocol(format!("unknown atyp: 0x{:02x}", other))),
		};
		if rest.len() < 2 {
			return Err(Error::Protocol("missing port".into()));
		}
		let port = u16::from_be_bytes([rest[0], rest[1]]);
		rest.advance(2);
		let addr = match addr {
			TargetAddr::V4(ip, _) => TargetAddr::V4(ip, port),
			TargetAddr::Domain(host, _) => TargetAddr::Domain(host, port),
			TargetAddr::V6(ip, _) => TargetAddr::V6(ip, port),
		};
		Ok((addr, rest))
	}
}

impl From<SocketAddr> for TargetAddr {
	fn from(addr: SocketAddr) -> Self {
		match addr {
			SocketAddr::V4(a) => TargetAddr::V4(*a.ip(), a.port()),
			SocketAddr::V6(a) => TargetAddr::V6(*a.ip(), a.port()),
		}
	}
}

impl fmt::Display for TargetAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.dial_string())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn roundtrip_v4() {
		let a = TargetAddr::V4(Ipv4Addr::new(127, 0, 0, 1), 80);
		let mut buf = bytes::BytesMut::with_capacity(a.encoded_len());
		a.encode(&mut buf);
		assert_eq!(buf.len(), a.encoded_len());
		let (decoded, rest) = TargetAddr::decode(&buf).unwrap();
		assert_eq!(decoded, a);
		assert!(rest.is_empty());
	}

	#[test]
	fn roundtrip_domain_with_trailing_data() {
		let a = TargetAddr::Domain("example.com".to_owned(), 443);
		let mut buf = bytes::BytesMut::with_capacity(a.encoded_len() + 3);
		a.encode(&mut buf);
		buf.extend_from_slice(b"abc");
		let (decoded, rest) = TargetAddr::decode(&buf).unwrap();
		assert_eq!(decoded, a);
		assert_eq!(rest, b"abc");
	}

	#[test]
	fn roundtrip_v6() {
		let a = TargetAddr::V6(Ipv6Addr::LOCALHOST, 8080);
		let mut buf = bytes::BytesMut::with_capacity(a.encoded_len());
		a.encode(&mut buf);
		let (decoded, _) = TargetAddr::decode(&buf).unwrap();
		assert_eq!(decoded, a);
	}

	#[test]
	fn unknown_atyp_rejected() {
		let buf = [0x02u8, 0, 0];
		assert!(TargetAddr::decode(&buf).is_err());
	}

	#[test]
	fn decodes_ipv4_triple_for_localhost_port_80() {
		// atyp=1, 127.0.0.1, port 80
		let buf = [0x01u8, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50];
		let (addr, rest) = TargetAddr::decode(&buf).unwrap();
		assert_eq!(addr, TargetAddr::V4(Ipv4Addr::new(127, 0, 0, 1), 80));
		assert_eq!(addr.dial_string(), "127.0.0.1:80");
		assert!(rest.is_empty());
	}
}
