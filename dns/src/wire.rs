//! RFC 1035 wire encoding, parsed and built by hand rather than via a
//! zero-copy byte-cast: DNS responses are untrusted network input, so
//! every field access here goes through a bounds-checked slice
//! instead of reinterpreting raw bytes as a packed struct.

use axproxy_utils::error::Result;

pub const DNS_NAME_SIZE_MAX: usize = 256;
pub const HEADER_LEN: usize = 12;

pub const TY_A: u16 = 1;
pub const TY_NS: u16 = 2;
pub const TY_CNAME: u16 = 5;
pub const CLASS_IN: u16 = 1;

/// The maximum number of compression-pointer jumps followed while decompressing one name.
/// Bounds CPU spent on adversarial packets independent of the resolver's overall query budget
/// (see Q2 in DESIGN.md).
const MAX_NAME_JUMPS: u32 = 64;

#[derive(Clone, Copy, Debug)]
pub struct Header {
	pub id: u16,
	pub flags: u16,
	pub qdcount: u16,
	pub ancount: u16,
	pub nscount: u16,
	pub arcount: u16,
}

pub const FLAG_QR: u16 = 1 << 15;
pub const FLAG_RD: u16 = 1 << 8;

impl Header {
	pub fn write(&self, out: &mut Vec<u8>) {
		out.extend_from_slice(&self.id.to_be_bytes());
		out.extend_from_slice(&self.flags.to_be_bytes());
		out.extend_from_slice(&self.qdcount.to_be_bytes());
		out.extend_from_slice(&self.ancount.to_be_bytes());
		out.extend_from_slice(&self.nscount.to_be_bytes());
		out.extend_from_slice(&self.arcount.to_be_bytes());
	}

	pub fn parse(buf: &[u8]) -> Result<Self> {
		if buf.len() < HEADER_LEN {
			return Err(());
		}

		let u16_at = |off: usize| u16::from_be_bytes([buf[off], buf[off + 1]]);

		Ok(Self {
			id: u16_at(0),
			flags: u16_at(2),
			qdcount: u16_at(4),
			ancount: u16_at(6),
			nscount: u16_at(8),
			arcount: u16_at(10),
		})
	}
}

/// Encodes `name` (e.g. `"a.b.c"`) as length-prefixed labels terminated by a zero byte
/// (`\x01a\x01b\x01c\x00`), appending to `out`. Fails before writing anything unrecoverable
/// if any label exceeds 255 bytes or the total encoded name would exceed `DNS_NAME_SIZE_MAX`.
pub fn encode_name(name: &str, out: &mut Vec<u8>) -> Result {
	let mut total = 1; // the terminating zero byte

	for label in name.split('.') {
		total += label.len() + 1;
	}

	if total > DNS_NAME_SIZE_MAX {
		return Err(());
	}

	for label in name.split('.') {
		let bytes = label.as_bytes();

		if bytes.is_empty() || bytes.len() > 255 {
			return Err(());
		}

		out.push(bytes.len() as u8);
		out.extend_from_slice(bytes);
	}

	out.push(0);
	Ok(())
}

/// Decompresses a name starting at `pos` within `packet`, following compression pointers
/// (labels prefixed `0xC0..=0xFF`) without regard for cycles beyond `MAX_NAME_JUMPS`. The
/// caller is additionally expected to bound total recursion via the query counter.
/// Writes the name to `out` in the same length-prefixed encoding `encode_name` produces.
/// Returns the offset in `packet` immediately after the name *as written at `pos`*
/// (i.e. after the first pointer or the terminating zero, whichever ends the in-place encoding).
pub fn decompress_name(packet: &[u8], pos: usize, out: &mut Vec<u8>) -> Result<usize> {
	let mut cursor = pos;
	let mut end = None;
	let mut jumps = 0;

	loop {
		let len = *packet.get(cursor).ok_or(())?;

		if len == 0 {
			out.push(0);
			end.get_or_insert(cursor + 1);
			return Ok(end.unwrap());
		}

		if len & 0xC0 == 0xC0 {
			let lo = *packet.get(cursor + 1).ok_or(())?;
			let pointer = (((len as u16) & 0x3F) << 8 | lo as u16) as usize;

			end.get_or_insert(cursor + 2);

			jumps += 1;
			if jumps > MAX_NAME_JUMPS {
				return Err(());
			}

			cursor = pointer;
			continue;
		}

		let label_len = len as usize;
		let label = packet.get(cursor + 1..cursor + 1 + label_len).ok_or(())?;

		out.push(len);
		out.extend_from_slice(label);

		if out.len() > DNS_NAME_SIZE_MAX {
			return Err(());
		}

		cursor += 1 + label_len;
	}
}

/// One resource record, with `rdata` borrowed from the original packet.
pub struct Rr<'a> {
	pub ty: u16,
	pub class: u16,
	pub ttl: u32,
	pub rdata: &'a [u8],
}

/// Parses one resource record (name + fixed header + rdata) starting at `pos`. The name itself
/// is decompressed into a scratch buffer and discarded; callers that need it (NS/CNAME
/// targets) decompress again explicitly with [`decompress_name`].
/// Returns the record and the offset immediately following its rdata.
pub fn read_rr(buf: &[u8], pos: usize) -> Result<(Rr<'_>, usize)> {
	let mut scratch = Vec::with_capacity(DNS_NAME_SIZE_MAX);
	let after_name = decompress_name(buf, pos, &mut scratch)?;

	let fixed = buf.get(after_name..after_name + 10).ok_or(())?;

	let ty = u16::from_be_bytes([fixed[0], fixed[1]]);
	let class = u16::from_be_bytes([fixed[2], fixed[3]]);
	let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
	let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;

	let rdata_start = after_name + 10;
	let rdata = buf.get(rdata_start..rdata_start + rdlength).ok_or(())?;

	Ok((Rr { ty, class, ttl, rdata }, rdata_start + rdlength))
}

/// Skips the question section (QNAME + QTYPE + QCLASS) starting at `pos`.
pub fn skip_question(buf: &[u8], pos: usize) -> Result<usize> {
	let mut scratch = Vec::with_capacity(DNS_NAME_SIZE_MAX);
	let after_name = decompress_name(buf, pos, &mut scratch)?;

	if after_name + 4 > buf.len() {
		return Err(());
	}

	Ok(after_name + 4)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encodes_example_com() {
		let mut out = Vec::new();
		encode_name("www.example.com", &mut out).unwrap();

		assert_eq!(
			out,
			vec![3, b'w', b'w', b'w', 7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm', 0]
		);
	}

	#[test]
	fn rejects_oversized_total_name() {
		let long_label = "a".repeat(60);
		let name = vec![long_label; 5].join(".");
		let mut out = Vec::new();
		assert!(encode_name(&name, &mut out).is_err());
	}

	#[test]
	fn decompresses_plain_name_without_pointers() {
		let mut packet = Vec::new();
		encode_name("example.com", &mut packet).unwrap();

		let mut out = Vec::new();
		let end = decompress_name(&packet, 0, &mut out).unwrap();

		assert_eq!(end, packet.len());
		assert_eq!(out, packet);
	}

	#[test]
	fn decompresses_through_a_pointer() {
		// A packet where byte 0 starts "example.com\0", and a name at the end
		// is just a pointer back to offset 0.
		let mut packet = Vec::new();
		encode_name("example.com", &mut packet).unwrap();
		let pointer_pos = packet.len();
		packet.push(0xC0);
		packet.push(0x00);

		let mut out = Vec::new();
		let end = decompress_name(&packet, pointer_pos, &mut out).unwrap();

		assert_eq!(end, pointer_pos + 2);

		let mut direct = Vec::new();
		encode_name("example.com", &mut direct).unwrap();
		assert_eq!(out, direct);
	}

	#[test]
	fn rejects_runaway_pointer_chains() {
		// Two labels that point at each other forever.
		let mut packet = vec![0u8; 4];
		packet[0] = 0xC0;
		packet[1] = 2;
		packet[2] = 0xC0;
		packet[3] = 0;

		let mut out = Vec::new();
		assert!(decompress_name(&packet, 0, &mut out).is_err());
	}
}
