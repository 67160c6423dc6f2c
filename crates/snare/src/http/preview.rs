//! Classification of the first bytes off an accepted connection: real HTTP we
//! should interpose on, HTTP that immediately upgrades to another protocol, or
//! something else entirely.

use super::{Error, Request, known};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preview {
	/// Plain HTTP with the Host header extracted; interpose normally.
	Http { host: String },
	/// HTTP that requests an upgrade (e.g. WebSocket); forward the prelude
	/// verbatim and fall back to a raw passthrough.
	UpgradeHttp { host: String },
	/// Not HTTP at all.
	NotHttp,
	/// Plausibly HTTP but the header section has not fully arrived yet.
	Incomplete,
}

pub fn classify(data: &[u8]) -> Result<Preview, Error> {
	if data.is_empty() {
		return Err(Error::Malformed("empty preview".to_string()));
	}
	let mut probe = Request::new();
	match probe.feed(data) {
		Ok(()) => {
			if !probe.headers_complete() {
				return if looks_like_http(data) {
					Ok(Preview::Incomplete)
				} else {
					Ok(Preview::NotHttp)
				};
			}
			match probe.headers().first(known::HOST) {
				Some(host) => Ok(Preview::Http {
					host: host.trim().to_string(),
				}),
				None => Err(Error::Malformed("no host header in preview".to_string())),
			}
		},
		Err(Error::Upgrade) => match probe.headers().first(known::HOST) {
			Some(host) => Ok(Preview::UpgradeHttp {
				host: host.trim().to_string(),
			}),
			None => Err(Error::Malformed("upgrade without a host header".to_string())),
		},
		Err(_) if !looks_like_http(data) => Ok(Preview::NotHttp),
		Err(e) => Err(e),
	}
}

/// A request line starts with a method token followed by a space. Anything
/// else (a TLS record, binary protocol chatter) is not HTTP.
fn looks_like_http(data: &[u8]) -> bool {
	const MAX_METHOD: usize = 20;
	for (i, &b) in data.iter().take(MAX_METHOD + 1).enumerate() {
		match b {
			b' ' => return i > 0,
			b'A'..=b'Z' | b'-' | b'_' => continue,
			_ => return false,
		}
	}
	data.len() <= MAX_METHOD
}
