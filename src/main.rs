use std::time::Duration;

use clap::{Parser, Subcommand};
use log::*;

mod key;

#[derive(Parser)]
struct Args {
	#[command(subcommand)]
	cmd: Cmds,
}

#[derive(Subcommand)]
enum Cmds {
	/// Run the relay server.
	#[command(alias = "s")]
	Server {
		#[arg(long, short, default_value = "0.0.0.0:8080")]
		listen: String,

		#[arg(long, short = 'k', default_value = "psk")]
		psk: String,

		/// Idle timeout for TCP connections, in seconds. 0 disables it.
		#[arg(long, default_value_t = 300)]
		tcp_timeout: u64,

		/// Idle timeout for UDP exchanges, in seconds. 0 disables it.
		#[arg(long, default_value_t = 60)]
		udp_timeout: u64,
	},

	/// Generate a PSK file.
	GenPSK {
		#[arg(long, short = 'k', default_value = "psk")]
		out: String,
	},
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

	let args = Args::parse();

	match &args.cmd {
		Cmds::Server {
			listen,
			psk,
			tcp_timeout,
			udp_timeout,
		} => {
			run_server(listen, psk, *tcp_timeout, *udp_timeout).await;
		}
		Cmds::GenPSK { out } => {
			let psk = key::gen_psk();
			if let Err(e) = std::fs::write(out, &psk) {
				error!("failed to write \"{}\": {}", out, e);
				std::process::exit(1);
			}
			info!("wrote psk to {}", out);
		}
	}
}

async fn run_server(listen: &str, psk_path: &str, tcp_timeout: u64, udp_timeout: u64) {
	let Some(password) = key::load_psk(psk_path) else {
		std::process::exit(1);
	};

	let mut server = duskrelay::Server::new(
		listen.to_string(),
		password,
		Duration::from_secs(tcp_timeout),
		Duration::from_secs(udp_timeout),
	);

	if let Err(e) = server.listen_and_serve().await {
		error!("server exited: {}", e);
		std::process::exit(1);
	}
}
