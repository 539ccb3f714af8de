//! Server-side library for an encrypted TCP/UDP relay: a single listener that
//! speaks a length-framed, rotating-nonce AEAD protocol over TCP and a
//! single-shot-per-datagram AEAD protocol over UDP, dialing out to whatever
//! address the client asks for.

mod addr;
mod authman;
mod crypto;
mod dialer;
mod error;
mod framer;
mod packet;
mod server;
mod tcp;
mod udp;

pub use addr::TargetAddr;
pub use authman::{Authman, Internet, Protocol};
pub use dialer::{AsyncStream, Dialer, TokioDialer};
pub use error::{Error, Result};
pub use server::Server;
