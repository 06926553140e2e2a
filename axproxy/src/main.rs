//! `axproxy <ipv4>:<port>`: a single-process, non-blocking SOCKS5
//! forward proxy. See the module docs in `fsm`, `pool`, and
//! `supervisor` for the connection engine; CLI parsing here is
//! deliberately hand-rolled, matching the workspace's preference for
//! zero extra argument-parsing dependencies.

mod config;
mod fsm;
mod pool;
mod supervisor;

use std::net::SocketAddrV4;
use std::process;

/// Parses `<ipv4>:<port>`, rejecting port 0 (the valid CLI range is 1..65535).
fn parse_entrance(arg: &str) -> Option<SocketAddrV4> {
	let addr: SocketAddrV4 = arg.parse().ok()?;
	if addr.port() == 0 {
		return None;
	}
	Some(addr)
}

fn main() {
	let args: Vec<String> = std::env::args().collect();

	let verbose = args.iter().any(|a| a == "-v" || a == "--verbose");
	axproxy_runtime::logger::install(verbose);

	let entrance = args.iter().skip(1).find(|a| !a.starts_with('-'));

	let Some(entrance) = entrance else {
		eprintln!("usage: axproxy [-v] <ipv4>:<port>");
		process::exit(1);
	};

	let Some(addr) = parse_entrance(entrance) else {
		eprintln!("invalid entrance address: {entrance}");
		process::exit(1);
	};

	supervisor::supervise(addr);
}
