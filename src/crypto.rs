//! Key derivation and AEAD seal/open, shared by the stream framer and the packet
//! codec.
//!
//! The nonce is always 12 bytes and is treated, on the wire, as a plain big-endian
//! counter: `increment_nonce` adds one to it after every seal/open so that the same
//! (key, nonce) pair is never reused within a direction.

use aead::{AeadInPlace, KeyInit, generic_array::GenericArray};
use bytes::{BufMut, BytesMut};
use chacha20poly1305::ChaCha20Poly1305 as Cipher;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Error, Result};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

pub type Nonce = [u8; NONCE_LEN];
pub type KeyBytes = [u8; KEY_LEN];

/// Derive a 32-byte stream key from the shared password and a 12-byte nonce.
///
/// Uses HKDF-SHA256 with the nonce as salt and the password as input keying
/// material, domain-separated with a fixed info string so this key can never
/// collide with a key derived for a different purpose from the same password.
pub fn derive_key(password: &[u8], nonce: &Nonce) -> KeyBytes {
	let hk = Hkdf::<Sha256>::new(Some(nonce), password);
	let mut okm = [0u8; KEY_LEN];
	hk.expand(b"duskrelay-stream-key-v1", &mut okm)
		.expect("32 is a valid HKDF-SHA256 output length");
	okm
}

pub fn cipher_from_key(key: &KeyBytes) -> Cipher {
	Cipher::new_from_slice(key).expect("key is exactly KEY_LEN bytes")
}

pub fn random_nonce() -> Nonce {
	let mut n = [0u8; NONCE_LEN];
	rand::thread_rng().fill_bytes(&mut n);
	n
}

/// Treat `nonce` as a 12-byte big-endian counter and add one.
pub fn increment_nonce(nonce: &mut Nonce) {
	for byte in nonce.iter_mut().rev() {
		let (next, overflow) = byte.overflowing_add(1);
		*byte = next;
		if !overflow {
			break;
		}
	}
}

/// Seal `plaintext` in place under `key`/`nonce`, appending the 16-byte tag.
pub fn seal(key: &KeyBytes, nonce: &Nonce, plaintext: &[u8]) -> Vec<u8> {
	let cipher = cipher_from_key(key);
	let mut buf = BytesMut::with_capacity(plaintext.len() + TAG_LEN);
	buf.put_slice(plaintext);
	cipher
		.encrypt_in_place(GenericArray::from_slice(nonce), b"", &mut buf)
		.expect("chacha20poly1305 seal cannot fail for valid inputs");
	buf.to_vec()
}

/// Open `sealed` (ciphertext || tag) under `key`/`nonce`.
pub fn open(key: &KeyBytes, nonce: &Nonce, sealed: &[u8]) -> Result<Vec<u8>> {
	let cipher = cipher_from_key(key);
	let mut buf = BytesMut::with_capacity(sealed.len());
	buf.put_slice(sealed);
	cipher
		.decrypt_in_place(GenericArray::from_slice(nonce), b"", &mut buf)
		.map_err(|_| Error::Protocol("AEAD authentication failed".into()))?;
	Ok(buf.to_vec())
}
