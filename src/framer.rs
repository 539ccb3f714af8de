//! Length-prefixed AEAD record framing for TCP, once the initial 12-byte nonce
//! has been exchanged in the clear.
//!
//! Record layout: `seal(encLen, nonce) || seal(payload, nonce+1)`. The nonce is
//! incremented after each seal/open, so every record on a connection consumes two
//! nonce values. Maximum plaintext payload per record is [`MAX_PAYLOAD`] bytes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{self, KeyBytes, NONCE_LEN, Nonce, TAG_LEN};
use crate::error::{Error, Result};

pub const MAX_PAYLOAD: usize = 2048;
const SEALED_LEN_FIELD: usize = 2 + TAG_LEN;

/// Read one record from `r`, returning its plaintext payload and the nonce to use
/// for the next record.
pub async fn read_record<R: AsyncRead + Unpin>(
	r: &mut R,
	key: &KeyBytes,
	mut nonce: Nonce,
) -> Result<(Vec<u8>, Nonce)> {
	let mut sealed_len = [0u8; SEALED_LEN_FIELD];
	r.read_exact(&mut sealed_len)
		.await
		.map_err(|e| short_read_or_network(e))?;
	let len_bytes = crypto::open(key, &nonce, &sealed_len)?;
	crypto::increment_nonce(&mut nonce);

	let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
	if len > MAX_PAYLOAD {
		return Err(Error::Protocol(format!(
			"record payload {} exceeds max {}",
			len, MAX_PAYLOAD
		)));
	}

	let mut sealed_payload = vec![0u8; len + TAG_LEN];
	r.read_exact(&mut sealed_payload)
		.await
		.map_err(|e| short_read_or_network(e))?;
	let plaintext = crypto::open(key, &nonce, &sealed_payload)?;
	crypto::increment_nonce(&mut nonce);

	Ok((plaintext, nonce))
}

/// Write one record containing `payload` to `w`, returning the nonce to use for
/// the next record. `payload` must be at most [`MAX_PAYLOAD`] bytes; larger
/// payloads must be split by the caller.
pub async fn write_record<W: AsyncWrite + Unpin>(
	w: &mut W,
	payload: &[u8],
	key: &KeyBytes,
	mut nonce: Nonce,
) -> Result<Nonce> {
	if payload.len() > MAX_PAYLOAD {
		return Err(Error::Protocol(format!(
			"record payload {} exceeds max {}",
			payload.len(),
			MAX_PAYLOAD
		)));
	}

	let len_bytes = (payload.len() as u16).to_be_bytes();
	let sealed_len = crypto::seal(key, &nonce, &len_bytes);
	crypto::increment_nonce(&mut nonce);

	let sealed_payload = crypto::seal(key, &nonce, payload);
	crypto::increment_nonce(&mut nonce);

	w.write_all(&sealed_len).await?;
	w.write_all(&sealed_payload).await?;

	Ok(nonce)
}

/// Read the client's initial 12-byte nonce off the wire.
pub async fn read_initial_nonce<R: AsyncRead + Unpin>(r: &mut R) -> Result<Nonce> {
	let mut nonce = [0u8; NONCE_LEN];
	r.read_exact(&mut nonce).await?;
	Ok(nonce)
}

/// Write a freshly generated 12-byte nonce in the clear, as the first bytes of
/// the reverse direction.
pub async fn write_initial_nonce<W: AsyncWrite + Unpin>(w: &mut W, nonce: &Nonce) -> Result<()> {
	w.write_all(nonce).await?;
	Ok(())
}

fn short_read_or_network(e: std::io::Error) -> Error {
	if e.kind() == std::io::ErrorKind::UnexpectedEof {
		Error::Protocol("short read mid-record".into())
	} else {
		Error::Network(e)
	}
}
