//! PSK file handling: generate a random passphrase and load it back from disk.
//! The passphrase itself is opaque bytes; it becomes HKDF input key material,
//! never a cipher key directly, so any length works.

use log::*;

use base64::prelude::{BASE64_STANDARD_NO_PAD as BASE64, Engine as _};
use rand::RngCore;

const PSK_LEN: usize = 32;

pub fn gen_psk() -> String {
	let mut key = [0u8; PSK_LEN];
	rand::thread_rng().fill_bytes(&mut key);
	BASE64.encode(key)
}

pub fn load_psk(path: &str) -> Option<Vec<u8>> {
	let raw = std::fs::read(path)
		.map_err(|e| error!("failed to read \"{}\": {}", path, e))
		.ok()?;
	BASE64
		.decode((&raw as &[u8]).trim_ascii())
		.map_err(|e| error!("failed to decode base64: {}", e))
		.ok()
}
