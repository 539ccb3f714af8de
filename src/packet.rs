//! Single-shot AEAD codec for UDP datagrams.
//!
//! Wire format: `nonce(12) || seal(atyp || host || port || userData [|| token ||
//! uint16BE(tokenLen)], key)`, where `key = derive_key(password, nonce)`. Unlike the
//! stream framer, every datagram carries its own fresh random nonce since UDP has
//! no ordered connection to chain a rolling nonce over.

use bytes::{BufMut, BytesMut};

use crate::addr::TargetAddr;
use crate::crypto::{self, NONCE_LEN};
use crate::error::{Error, Result};

pub const MAX_DATAGRAM: usize = 65535;

/// Encrypt `atyp||host||port||userData` with a fresh random nonce.
pub fn encrypt(password: &[u8], addr: &TargetAddr, user_data: &[u8]) -> Vec<u8> {
	let nonce = crypto::random_nonce();
	let key = crypto::derive_key(password, &nonce);

	let mut plaintext = BytesMut::with_capacity(addr.encoded_len() + user_data.len());
	addr.encode(&mut plaintext);
	plaintext.put_slice(user_data);

	let sealed = crypto::seal(&key, &nonce, &plaintext);

	let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
	out.extend_from_slice(&nonce);
	out.extend_from_slice(&sealed);
	out
}

/// Decrypt a datagram, returning the destination address and the remaining
/// plaintext (user data, possibly still carrying a trailing Authman token, see
/// [`strip_trailing_token`]).
pub fn decrypt(password: &[u8], datagram: &[u8]) -> Result<(TargetAddr, Vec<u8>)> {
	if datagram.len() < NONCE_LEN {
		return Err(Error::Protocol("datagram shorter than nonce".into()));
	}
	let mut nonce = [0u8; NONCE_LEN];
	nonce.copy_from_slice(&datagram[..NONCE_LEN]);
	let key = crypto::derive_key(password, &nonce);

	let plaintext = crypto::open(&key, &nonce, &datagram[NONCE_LEN..])?;
	let (addr, rest) = TargetAddr::decode(&plaintext)?;
	Ok((addr, rest.to_vec()))
}

/// When Authman is active, the last two bytes of the plaintext tail are a
/// big-endian token length, and the `len` bytes before that are the token
/// itself. Returns `(user_data, token)`.
pub fn strip_trailing_token(data: &[u8]) -> (&[u8], Option<&[u8]>) {
	if data.len() < 2 {
		return (data, None);
	}
	let split = data.len() - 2;
	let len = u16::from_be_bytes([data[split], data[split + 1]]) as usize;
	if len > split {
		return (data, None);
	}
	let token_start = split - len;
	(&data[..token_start], Some(&data[token_start..split]))
}
