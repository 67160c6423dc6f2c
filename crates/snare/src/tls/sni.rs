//! Hand-rolled extraction of the SNI hostname from a peeked TLS ClientHello.
//!
//! The TLS library's own SNI hooks are bound to a single server context and
//! cannot carry per-connection state, and we need the hostname *before* any
//! handshake begins so the upstream certificate can be fetched and spoofed
//! first. So the hello is parsed manually, bounds-checked at every step; for
//! any input, valid or hostile, this never reads past the supplied slice.

/// Record header (5) + handshake header (4) + client version (2) + random
/// (32): the minimum prefix before the session id, and therefore the least
/// data worth looking at.
const MIN_HELLO: usize = 43;

const CONTENT_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const EXTENSION_SNI: u16 = 0;
const SNI_NAME_HOST: u8 = 0;

/// Pull the first `host_name` entry out of the hello's SNI extension.
/// Returns `None` for anything that is not a well-formed TLS 1.x ClientHello
/// carrying one.
pub fn extract_host(data: &[u8]) -> Option<String> {
	if data.len() < MIN_HELLO {
		return None;
	}
	if data[0] != CONTENT_TYPE_HANDSHAKE {
		return None;
	}
	// Record-layer version; 3.1 through 3.4 cover TLS 1.0+.
	if data[1] != 3 || data[2] == 0 {
		return None;
	}
	if data[5] != HANDSHAKE_CLIENT_HELLO {
		return None;
	}

	let mut pos = MIN_HELLO;

	// Session id.
	let session_id_len = read_u8(data, pos)? as usize;
	pos = pos.checked_add(1 + session_id_len)?;

	// Cipher suites.
	let cipher_suites_len = read_u16(data, pos)? as usize;
	pos = pos.checked_add(2 + cipher_suites_len)?;

	// Compression methods.
	let compression_len = read_u8(data, pos)? as usize;
	pos = pos.checked_add(1 + compression_len)?;

	// Extensions.
	let extensions_len = read_u16(data, pos)? as usize;
	pos = pos.checked_add(2)?;
	let extensions_end = pos.checked_add(extensions_len)?.min(data.len());

	while pos + 4 <= extensions_end {
		let ext_type = read_u16(data, pos)?;
		let ext_len = read_u16(data, pos + 2)? as usize;
		pos += 4;
		let ext_end = pos.checked_add(ext_len)?.min(extensions_end);

		if ext_type != EXTENSION_SNI {
			pos = pos.checked_add(ext_len)?;
			continue;
		}

		// Server name list: u16 list length, then (type u8, length u16, name)
		// entries. Take the first host_name entry.
		let mut entry = pos.checked_add(2)?;
		while entry + 3 <= ext_end {
			let name_type = read_u8(data, entry)?;
			let name_len = read_u16(data, entry + 1)? as usize;
			let name_start = entry + 3;
			let name_end = name_start.checked_add(name_len)?;
			if name_end > ext_end {
				return None;
			}
			if name_type == SNI_NAME_HOST {
				if name_len == 0 {
					return None;
				}
				return std::str::from_utf8(&data[name_start..name_end])
					.ok()
					.map(|s| s.to_string());
			}
			entry = name_end;
		}
		return None;
	}

	None
}

fn read_u8(data: &[u8], pos: usize) -> Option<u8> {
	data.get(pos).copied()
}

fn read_u16(data: &[u8], pos: usize) -> Option<u16> {
	Some(u16::from_be_bytes([
		*data.get(pos)?,
		*data.get(pos + 1)?,
	]))
}
