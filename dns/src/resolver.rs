//! A synchronous, recursive DNS resolver that speaks UDP/53 directly.
//! The proxy never asks the system resolver: name resolution is a
//! first-class, timeout-bounded part of the CONNECT path rather than
//! something delegated to libc.
//!
//! This is the one place in the core allowed to block: callers run it
//! off the reactor thread (or accept the stall) because each query has
//! a hard 3-second send/recv timeout and the whole recursive descent is
//! bounded by [`DNS_QUERY_LIMIT`].

use std::net::{Ipv4Addr, UdpSocket};
use std::time::Duration;

use log::debug;
use rand::Rng;

use axproxy_utils::error::Result;

use crate::wire::{self, Header, CLASS_IN, FLAG_RD, HEADER_LEN, TY_A, TY_CNAME, TY_NS};

/// Recursive Google DNS resolvers, queried directly over UDP rather than
/// walking the root hint zone, mirroring the two fixed servers the original
/// resolver hard-coded.
const ROOT_SERVERS: [Ipv4Addr; 2] = [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)];

const DNS_QUERY_LIMIT: u32 = 48;
const UDP_PKT_LEN_MAX: usize = 65536;
const DNS_TIMEOUT: Duration = Duration::from_secs(3);

/// Resolves `name` to an IPv4 address, descending through NS/CNAME referrals
/// starting from a randomly chosen root server, bounded by [`DNS_QUERY_LIMIT`]
/// total queries across the whole recursive descent.
pub fn resolve(name: &str) -> Result<Ipv4Addr> {
	let mut encoded = Vec::with_capacity(wire::DNS_NAME_SIZE_MAX);
	wire::encode_name(name, &mut encoded)?;

	let mut query_count = 0;
	resolve_root(&encoded, &mut query_count)
}

fn resolve_root(encoded: &[u8], query_count: &mut u32) -> Result<Ipv4Addr> {
	let ns = ROOT_SERVERS[rand::thread_rng().gen_range(0..ROOT_SERVERS.len())];
	query(encoded, query_count, ns)
}

/// Sends one query to `ns` and walks ANSWER, then ADDITIONAL (recursing into any A glue),
/// then AUTHORITY (recursing via NS referral resolved from the top), then ANSWER again
/// (following a CNAME), exactly the precedence the original implementation used.
fn query(encoded: &[u8], query_count: &mut u32, ns: Ipv4Addr) -> Result<Ipv4Addr> {
	if *query_count >= DNS_QUERY_LIMIT {
		return Err(());
	}
	*query_count += 1;

	let query_id: u16 = rand::thread_rng().gen();

	let mut packet = Vec::with_capacity(HEADER_LEN + encoded.len() + 4);
	Header { id: query_id, flags: FLAG_RD, qdcount: 1, ancount: 0, nscount: 0, arcount: 0 }.write(&mut packet);
	packet.extend_from_slice(encoded);
	packet.extend_from_slice(&TY_A.to_be_bytes());
	packet.extend_from_slice(&CLASS_IN.to_be_bytes());

	let socket = UdpSocket::bind("0.0.0.0:0").map_err(|_| ())?;
	socket.set_read_timeout(Some(DNS_TIMEOUT)).map_err(|_| ())?;
	socket.set_write_timeout(Some(DNS_TIMEOUT)).map_err(|_| ())?;
	socket.connect((ns, 53)).map_err(|_| ())?;
	socket.send(&packet).map_err(|_| ())?;

	let mut buf = vec![0u8; UDP_PKT_LEN_MAX];
	let mut reply_len = None;

	// A stray datagram (late reply to an earlier query, or off-path spoof attempt)
	// doesn't abort the query; only a matching id+question does, up to 255 tries.
	for _ in 0..255u32 {
		let n = match socket.recv(&mut buf) {
			Ok(n) => n,
			Err(_) => return Err(()),
		};

		if n < packet.len() {
			continue;
		}

		if buf[0..2] == query_id.to_be_bytes() && buf[HEADER_LEN..packet.len()] == packet[HEADER_LEN..] {
			reply_len = Some(n);
			break;
		}
	}

	let reply_len = reply_len.ok_or(())?;
	let buf = &buf[..reply_len];

	let header = Header::parse(buf)?;
	let question_end = wire::skip_question(buf, HEADER_LEN)?;

	let mut pos = question_end;
	let mut records = Vec::with_capacity(header.ancount as usize);
	for _ in 0..header.ancount {
		let (rr, next) = wire::read_rr(buf, pos)?;
		records.push((pos, rr.ty, rr.class, rr.rdata.to_vec()));
		pos = next;
	}

	for (_, ty, class, rdata) in &records {
		if *ty == TY_A && *class == CLASS_IN && rdata.len() == 4 {
			let octets: [u8; 4] = rdata.as_slice().try_into().unwrap();
			return Ok(Ipv4Addr::from(octets));
		}
	}

	let authority_start = pos;
	let mut additional_records = Vec::with_capacity(header.arcount as usize);
	for _ in 0..header.nscount {
		let (_, next) = wire::read_rr(buf, pos)?;
		pos = next;
	}
	for _ in 0..header.arcount {
		let (rr, next) = wire::read_rr(buf, pos)?;
		additional_records.push((rr.ty, rr.class, rr.rdata.to_vec()));
		pos = next;
	}

	for (ty, class, rdata) in &additional_records {
		if *ty == TY_A && *class == CLASS_IN && rdata.len() == 4 {
			let octets: [u8; 4] = rdata.as_slice().try_into().unwrap();
			let glue = Ipv4Addr::from(octets);

			if let Ok(addr) = query(encoded, query_count, glue) {
				return Ok(addr);
			}
		}
	}

	let mut pos = authority_start;
	for _ in 0..header.nscount {
		let (rr, next) = wire::read_rr(buf, pos)?;

		if rr.ty == TY_NS {
			let rdata_pos = next - rr.rdata.len();
			let mut ns_name = Vec::with_capacity(wire::DNS_NAME_SIZE_MAX);
			if wire::decompress_name(buf, rdata_pos, &mut ns_name).is_ok() {
				if let Ok(ns_addr) = resolve_root(&ns_name, query_count) {
					if let Ok(addr) = query(encoded, query_count, ns_addr) {
						return Ok(addr);
					}
				}
			}
		}

		pos = next;
	}

	let mut pos = question_end;
	for _ in 0..header.ancount {
		let (rr, next) = wire::read_rr(buf, pos)?;

		if rr.ty == TY_CNAME {
			let rdata_pos = next - rr.rdata.len();
			let mut cname = Vec::with_capacity(wire::DNS_NAME_SIZE_MAX);
			if wire::decompress_name(buf, rdata_pos, &mut cname).is_ok() {
				if let Ok(addr) = resolve_root(&cname, query_count) {
					return Ok(addr);
				}
			}
		}

		pos = next;
	}

	debug!("dns: no usable record for this query at {ns}");
	Err(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn query_count_bound_rejects_before_sending() {
		let mut count = DNS_QUERY_LIMIT;
		let mut encoded = Vec::new();
		wire::encode_name("example.com", &mut encoded).unwrap();
		assert!(query(&encoded, &mut count, ROOT_SERVERS[0]).is_err());
	}
}
