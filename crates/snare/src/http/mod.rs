//! Byte-level model of a single HTTP/1.x message as it moves through the
//! proxy: incremental parse off the socket, header mutation, optional
//! full-body buffering for inspection, and re-serialization toward the peer.

use std::ops::{Deref, DerefMut};
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

pub mod compression;
pub mod known;
pub(crate) mod parser;
pub mod preview;

use parser::{Event, Kind, Parser};

/// Size of the region handed out for a single socket read.
pub(crate) const READ_CHUNK: usize = 131072;

/// Hard ceiling on a payload accumulated for inspection.
pub const MAX_BUFFERED_PAYLOAD: usize = 10_000_000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("malformed http message: {0}")]
	Malformed(String),
	#[error("peer requested an http upgrade")]
	Upgrade,
	#[error("buffered payload would exceed {MAX_BUFFERED_PAYLOAD} bytes")]
	PayloadTooLarge,
	#[error("connection closed mid-message")]
	TruncatedMessage,
	#[error("unsupported content encoding {0:?}")]
	UnsupportedEncoding(String),
	#[error("decode failed: {0}")]
	Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Version {
	Http10,
	#[default]
	Http11,
	/// Parsed but never spoken; the proxy only carries HTTP/1.x.
	H2,
}

impl Version {
	pub fn as_str(&self) -> &'static str {
		match self {
			Version::Http10 => "HTTP/1.0",
			Version::Http11 => "HTTP/1.1",
			Version::H2 => "HTTP/2.0",
		}
	}

	fn from_minor(minor: u8) -> Self {
		match minor {
			0 => Version::Http10,
			_ => Version::Http11,
		}
	}
}

impl std::fmt::Display for Version {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Ordered multimap with case-insensitive names. Duplicate headers such as
/// `Set-Cookie` survive in insertion order.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
	entries: Vec<(String, String)>,
}

impl HeaderMap {
	pub fn get<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
		let name = name.to_ascii_lowercase();
		self
			.entries
			.iter()
			.filter(move |(n, _)| n.eq_ignore_ascii_case(&name))
			.map(|(_, v)| v.as_str())
	}

	pub fn first(&self, name: &str) -> Option<&str> {
		self.get(name).next()
	}

	pub fn contains(&self, name: &str) -> bool {
		self.first(name).is_some()
	}

	pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>, replace: bool) {
		let name = name.into();
		let value = value.into();
		if replace {
			self.remove(&name);
		} else if self
			.entries
			.iter()
			.any(|(n, v)| n.eq_ignore_ascii_case(&name) && v.eq_ignore_ascii_case(&value))
		{
			// Exact name and value already present.
			return;
		}
		self.entries.push((name, value));
	}

	pub fn remove(&mut self, name: &str) {
		self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
	}

	/// Remove only entries whose value also matches, case-insensitively.
	pub fn remove_value(&mut self, name: &str, value: &str) {
		self
			.entries
			.retain(|(n, v)| !(n.eq_ignore_ascii_case(name) && v.eq_ignore_ascii_case(value)));
	}

	pub fn clear(&mut self) {
		self.entries.clear();
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	fn write_to(&self, out: &mut Vec<u8>) {
		for (name, value) in &self.entries {
			out.extend_from_slice(name.as_bytes());
			out.extend_from_slice(b": ");
			out.extend_from_slice(value.as_bytes());
			out.extend_from_slice(b"\r\n");
		}
	}
}

#[derive(Debug)]
pub struct Message {
	kind: Kind,
	version: Version,
	headers: HeaderMap,
	payload: BytesMut,
	scratch: Vec<u8>,
	parser: Parser,
	events: Vec<Event>,

	headers_complete: bool,
	payload_complete: bool,
	headers_sent: bool,
	consume_all_before_sending: bool,
	/// -1 = whitelisted, 0 = undecided, >= 1 = blocked with that category.
	should_block: i32,
	saw_excess: bool,

	// Request side.
	method: String,
	target: String,
	// Response side.
	status_code: u16,
	reason: String,
}

impl Message {
	fn new(kind: Kind) -> Self {
		Self {
			kind,
			version: Version::default(),
			headers: HeaderMap::default(),
			payload: BytesMut::new(),
			scratch: Vec::new(),
			parser: Parser::new(kind),
			events: Vec::new(),
			headers_complete: false,
			payload_complete: false,
			headers_sent: false,
			consume_all_before_sending: false,
			should_block: 0,
			saw_excess: false,
			method: String::new(),
			target: String::new(),
			status_code: 0,
			reason: String::new(),
		}
	}

	pub fn version(&self) -> Version {
		self.version
	}

	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	pub fn headers_mut(&mut self) -> &mut HeaderMap {
		&mut self.headers
	}

	pub fn payload(&self) -> &[u8] {
		&self.payload
	}

	pub fn headers_complete(&self) -> bool {
		self.headers_complete
	}

	pub fn payload_complete(&self) -> bool {
		self.payload_complete
	}

	pub fn consume_all_before_sending(&self) -> bool {
		self.consume_all_before_sending
	}

	pub fn set_consume_all_before_sending(&mut self, value: bool) {
		self.consume_all_before_sending = value;
	}

	pub fn should_block(&self) -> i32 {
		self.should_block
	}

	pub fn set_should_block(&mut self, category: i32) {
		self.should_block = category;
	}

	/// Bytes arrived beyond the end of this message (pipelining). The bridge
	/// refuses keep-alive when set, because those bytes were dropped.
	pub(crate) fn saw_excess(&self) -> bool {
		self.saw_excess
	}

	/// Region for the next socket read. In streaming mode the previously
	/// forwarded payload bytes are cleared first; in buffering mode new bytes
	/// append, bounded by [`MAX_BUFFERED_PAYLOAD`].
	pub fn read_buf(&mut self) -> Result<&mut [u8], Error> {
		if self.scratch.len() < READ_CHUNK {
			self.scratch.resize(READ_CHUNK, 0);
		}
		if self.headers_complete && !self.consume_all_before_sending {
			self.payload.clear();
		}
		if self.consume_all_before_sending && self.payload.len() + READ_CHUNK > MAX_BUFFERED_PAYLOAD
		{
			return Err(Error::PayloadTooLarge);
		}
		Ok(&mut self.scratch[..READ_CHUNK])
	}

	/// Feed the most recent `n` bytes of [`Self::read_buf`] to the parser.
	pub fn parse(&mut self, n: usize) -> Result<(), Error> {
		debug_assert!(n <= self.scratch.len());
		let mut events = std::mem::take(&mut self.events);
		events.clear();
		let res = self.parser.advance(&self.scratch[..n], &mut events);
		let mut upgraded = false;
		for ev in events.drain(..) {
			upgraded |= self.apply(ev);
		}
		self.events = events;
		res?;
		if upgraded {
			return Err(Error::Upgrade);
		}
		Ok(())
	}

	/// Copy already-read bytes (e.g. the classification preview) into the
	/// message and parse them.
	pub fn feed(&mut self, data: &[u8]) -> Result<(), Error> {
		if self.scratch.len() < READ_CHUNK.max(data.len()) {
			self.scratch.resize(READ_CHUNK.max(data.len()), 0);
		}
		self.scratch[..data.len()].copy_from_slice(data);
		self.parse(data.len())
	}

	/// The peer closed its write side. Completes read-to-EOF bodies; anything
	/// else mid-message is a truncation.
	pub fn finish_eof(&mut self) -> Result<(), Error> {
		let mut events = std::mem::take(&mut self.events);
		events.clear();
		let res = self.parser.finish_eof(&mut events);
		for ev in events.drain(..) {
			self.apply(ev);
		}
		self.events = events;
		res
	}

	fn apply(&mut self, event: Event) -> bool {
		match event {
			Event::RequestLine {
				method,
				target,
				version,
			} => {
				self.method = method;
				self.target = target;
				self.version = version;
			},
			Event::StatusLine {
				code,
				reason,
				version,
			} => {
				self.status_code = code;
				self.reason = reason;
				self.version = version;
			},
			Event::Header { name, value } => self.headers.add(name, value, false),
			Event::HeadersComplete { upgrade } => {
				self.headers_complete = true;
				self.headers_sent = false;
				return upgrade;
			},
			Event::Body(data) => self.payload.extend_from_slice(&data),
			Event::ChunkHeader(size) => {
				self
					.payload
					.extend_from_slice(format!("{size:x}\r\n").as_bytes());
			},
			Event::ChunkData(data) => self.payload.extend_from_slice(&data),
			Event::ChunkComplete => self.payload.extend_from_slice(b"\r\n"),
			Event::MessageComplete => self.payload_complete = true,
			Event::Excess => self.saw_excess = true,
		}
		false
	}

	fn start_line(&self) -> String {
		match self.kind {
			Kind::Request => format!("{} {} {}", self.method, self.target, self.version),
			Kind::Response => {
				let reason = if self.reason.is_empty() {
					reason_phrase(self.status_code)
				} else {
					&self.reason
				};
				format!("{} {} {}", self.version, self.status_code, reason)
			},
		}
	}

	/// Wire form of the start line and current header set, terminated by the
	/// empty line. This is also what the policy hooks receive.
	pub fn head_bytes(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(256);
		out.extend_from_slice(self.start_line().as_bytes());
		out.extend_from_slice(b"\r\n");
		self.headers.write_to(&mut out);
		out.extend_from_slice(b"\r\n");
		out
	}

	/// Contiguous bytes to transmit. The first call serializes the current
	/// headers in front of the payload and latches `headers_sent`; later calls
	/// return just the payload bytes.
	pub fn write_buffer(&mut self) -> Bytes {
		if !self.headers_sent {
			let mut combined = self.head_bytes();
			combined.extend_from_slice(&self.payload);
			self.payload.clear();
			self.payload.extend_from_slice(&combined);
			self.headers_sent = true;
		}
		Bytes::copy_from_slice(&self.payload)
	}

	/// Replace the payload. Without `includes_headers` the framing headers are
	/// stripped and a fresh `Content-Length` is emitted; with it, the supplied
	/// bytes are assumed to be a complete wire-form message and the header map
	/// is discarded.
	pub fn set_payload(&mut self, payload: impl Into<Bytes>, includes_headers: bool) {
		let payload = payload.into();
		self.payload.clear();
		self.payload.extend_from_slice(&payload);
		self.payload_complete = true;

		if includes_headers {
			self.headers.clear();
			self.headers_sent = true;
			self.headers_complete = true;
		} else {
			self.headers.remove(known::CONTENT_LENGTH);
			self.headers.remove(known::TRANSFER_ENCODING);
			self.headers.remove(known::CONTENT_ENCODING);
			self
				.headers
				.add(known::CONTENT_LENGTH, self.payload.len().to_string(), false);
		}
	}

	/// Synthesize a complete `204 No Content` used for silent blocks.
	pub fn make_204(&mut self) {
		let now = httpdate::fmt_http_date(SystemTime::now());
		let epoch = httpdate::fmt_http_date(SystemTime::UNIX_EPOCH);
		let version = match self.version {
			Version::Http10 => Version::Http10,
			_ => Version::Http11,
		};
		let body = format!(
			"{} 204 No Content\r\nDate: {now}\r\nExpires: {epoch}\r\nContent-Length: 0\r\n\r\n",
			version.as_str(),
		);
		self.payload.clear();
		self.payload.extend_from_slice(body.as_bytes());
		self.headers.clear();
		self.headers_sent = true;
		self.headers_complete = true;
		self.payload_complete = true;
	}

	pub fn is_chunked(&self) -> bool {
		self
			.headers
			.get(known::TRANSFER_ENCODING)
			.any(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("chunked")))
	}

	pub fn is_compressed(&self) -> bool {
		self.headers.contains(known::CONTENT_ENCODING)
	}

	fn content_type_contains(&self, needle: &str) -> bool {
		self.headers.get(known::CONTENT_TYPE).any(|v| {
			v.to_ascii_lowercase().contains(needle)
		})
	}

	pub fn is_text(&self) -> bool {
		self.content_type_contains("text/")
			|| self.content_type_contains("html")
			|| self.content_type_contains("json")
	}

	pub fn is_html(&self) -> bool {
		self.content_type_contains("html")
	}

	pub fn is_json(&self) -> bool {
		self.content_type_contains("json")
	}

	pub fn is_image(&self) -> bool {
		self.content_type_contains("image/")
	}

	pub fn is_css(&self) -> bool {
		self.content_type_contains("css")
	}

	pub fn is_javascript(&self) -> bool {
		self.content_type_contains("javascript")
	}

	/// Replay the accumulated wire bytes through a capture-only parser and
	/// re-frame the message as fixed-length. Compressed payloads keep their
	/// `Content-Encoding` so a following [`Self::decompress`] can finish the
	/// normalization.
	pub fn convert_chunked_to_fixed_length(&mut self) -> Result<(), Error> {
		let head = self.head_bytes();
		let mut replay = Parser::new(self.kind);
		let mut events = Vec::new();
		replay.advance(&head, &mut events)?;
		replay.advance(&self.payload, &mut events)?;
		let _ = replay.finish_eof(&mut events);
		let mut body = Vec::with_capacity(self.payload.len());
		for ev in events {
			match ev {
				Event::Body(b) | Event::ChunkData(b) => body.extend_from_slice(&b),
				_ => {},
			}
		}
		if body.is_empty() {
			debug!("buffered payload is empty after dechunking; leaving message untouched");
			return Ok(());
		}
		if self.is_compressed() {
			self.payload.clear();
			self.payload.extend_from_slice(&body);
			self.payload_complete = true;
		} else {
			self.set_payload(body, false);
		}
		Ok(())
	}

	/// Decode a gzip or deflate payload in place, then drop the
	/// `Content-Encoding` and `Transfer-Encoding` headers. Compressed bytes
	/// that decode to nothing are legal.
	pub async fn decompress(&mut self) -> Result<(), Error> {
		let Some(encoding) = self.headers.first(known::CONTENT_ENCODING) else {
			return Ok(());
		};
		let encoding = encoding.trim().to_ascii_lowercase();
		if encoding != compression::GZIP && encoding != compression::DEFLATE {
			return Err(Error::UnsupportedEncoding(encoding));
		}
		if self.payload.is_empty() {
			self.headers.remove(known::CONTENT_ENCODING);
			self.headers.remove(known::TRANSFER_ENCODING);
			return Ok(());
		}
		let decoded = compression::decode(&self.payload, &encoding).await?;
		self.set_payload(decoded, false);
		Ok(())
	}

	pub async fn compress_gzip(&mut self) -> Result<(), Error> {
		self.compress(compression::GZIP).await
	}

	pub async fn compress_deflate(&mut self) -> Result<(), Error> {
		self.compress(compression::DEFLATE).await
	}

	async fn compress(&mut self, encoding: &'static str) -> Result<(), Error> {
		if self.payload.is_empty() {
			warn!("no payload to compress");
			return Ok(());
		}
		let encoded = compression::encode(&self.payload, encoding).await?;
		self.set_payload(encoded, false);
		self.headers.add(known::CONTENT_ENCODING, encoding, true);
		Ok(())
	}

	/// Normalize a fully buffered message for inspection: dechunk, then decode
	/// the content encoding, leaving an identity fixed-length body.
	pub async fn finalize_buffered(&mut self) -> Result<(), Error> {
		self.convert_chunked_to_fixed_length()?;
		if self.is_compressed() {
			self.decompress().await?;
		}
		Ok(())
	}
}

#[derive(Debug)]
pub struct Request(Message);

impl Request {
	#[allow(clippy::new_without_default)]
	pub fn new() -> Self {
		Self(Message::new(Kind::Request))
	}

	pub fn method(&self) -> &str {
		&self.0.method
	}

	pub fn target(&self) -> &str {
		&self.0.target
	}
}

impl Deref for Request {
	type Target = Message;

	fn deref(&self) -> &Message {
		&self.0
	}
}

impl DerefMut for Request {
	fn deref_mut(&mut self) -> &mut Message {
		&mut self.0
	}
}

#[derive(Debug)]
pub struct Response(Message);

impl Response {
	#[allow(clippy::new_without_default)]
	pub fn new() -> Self {
		Self(Message::new(Kind::Response))
	}

	pub fn status(&self) -> u16 {
		self.0.status_code
	}

	pub fn set_status(&mut self, code: u16) {
		self.0.status_code = code;
		self.0.reason = reason_phrase(code).to_string();
	}

	pub fn status_line(&self) -> String {
		self.0.start_line()
	}
}

impl Deref for Response {
	type Target = Message;

	fn deref(&self) -> &Message {
		&self.0
	}
}

impl DerefMut for Response {
	fn deref_mut(&mut self) -> &mut Message {
		&mut self.0
	}
}

fn reason_phrase(code: u16) -> &'static str {
	match code {
		100 => "Continue",
		101 => "Switching Protocols",
		200 => "OK",
		201 => "Created",
		202 => "Accepted",
		204 => "No Content",
		206 => "Partial Content",
		301 => "Moved Permanently",
		302 => "Found",
		303 => "See Other",
		304 => "Not Modified",
		307 => "Temporary Redirect",
		308 => "Permanent Redirect",
		400 => "Bad Request",
		401 => "Unauthorized",
		403 => "Forbidden",
		404 => "Not Found",
		405 => "Method Not Allowed",
		408 => "Request Timeout",
		409 => "Conflict",
		410 => "Gone",
		411 => "Length Required",
		413 => "Payload Too Large",
		414 => "URI Too Long",
		415 => "Unsupported Media Type",
		429 => "Too Many Requests",
		500 => "Internal Server Error",
		501 => "Not Implemented",
		502 => "Bad Gateway",
		503 => "Service Unavailable",
		504 => "Gateway Timeout",
		505 => "HTTP Version Not Supported",
		_ => "Unknown",
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parsed_request(wire: &[u8]) -> Request {
		let mut req = Request::new();
		req.feed(wire).unwrap();
		req
	}

	fn parsed_response(wire: &[u8]) -> Response {
		let mut resp = Response::new();
		resp.feed(wire).unwrap();
		resp
	}

	#[test]
	fn header_lookup_is_case_insensitive() {
		let req = parsed_request(b"GET / HTTP/1.1\r\nHost: h\r\nContent-Type: text/html\r\n\r\n");
		for name in ["content-type", "Content-Type", "CONTENT-TYPE"] {
			assert_eq!(req.headers().first(name), Some("text/html"));
		}
	}

	#[test]
	fn duplicate_headers_survive_round_trip() {
		let wire = b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\nContent-Length: 0\r\n\r\n";
		let mut resp = parsed_response(wire);
		let reparsed = parsed_response(&resp.write_buffer());
		let original: Vec<(String, String)> = resp
			.headers()
			.iter()
			.map(|(n, v)| (n.to_string(), v.to_string()))
			.collect();
		let round_tripped: Vec<(String, String)> = reparsed
			.headers()
			.iter()
			.map(|(n, v)| (n.to_string(), v.to_string()))
			.collect();
		assert_eq!(original, round_tripped);
		let cookies: Vec<&str> = reparsed.headers().get("set-cookie").collect();
		assert_eq!(cookies, vec!["a=1", "b=2"]);
	}

	#[test]
	fn add_with_replace_drops_all_prior_entries() {
		let mut req = parsed_request(b"GET / HTTP/1.1\r\nAccept-Encoding: br\r\nAccept-Encoding: zstd\r\n\r\n");
		req.headers_mut().add(known::ACCEPT_ENCODING, "gzip", true);
		let values: Vec<&str> = req.headers().get(known::ACCEPT_ENCODING).collect();
		assert_eq!(values, vec!["gzip"]);
	}

	#[test]
	fn set_payload_refreshes_framing_headers() {
		let mut resp = parsed_response(
			b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n",
		);
		resp.set_payload(&b"replacement"[..], false);
		assert_eq!(resp.headers().first(known::CONTENT_LENGTH), Some("11"));
		assert!(!resp.headers().contains(known::CONTENT_ENCODING));
		assert!(!resp.headers().contains(known::TRANSFER_ENCODING));
		assert_eq!(resp.payload(), b"replacement");
	}

	#[test]
	fn set_payload_with_headers_discards_header_map() {
		let mut req = parsed_request(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
		req.set_payload(&b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n"[..], true);
		assert!(req.headers().is_empty());
		let wire = req.write_buffer();
		assert!(wire.starts_with(b"HTTP/1.1 204"));
	}

	#[test]
	fn make_204_wire_form() {
		let mut resp = parsed_response(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
		resp.make_204();
		let wire = resp.write_buffer();
		let text = std::str::from_utf8(&wire).unwrap();
		assert!(text.starts_with("HTTP/1.1 204 No Content\r\nDate: "));
		assert!(text.contains("\r\nExpires: Thu, 01 Jan 1970 00:00:00 GMT\r\n"));
		assert!(text.ends_with("\r\nContent-Length: 0\r\n\r\n"));
	}

	#[test]
	fn write_buffer_serializes_headers_exactly_once() {
		let mut req = parsed_request(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n");
		let first = req.write_buffer();
		assert!(first.starts_with(b"GET /a HTTP/1.1\r\n"));
		// Streaming mode: the next read clears forwarded bytes.
		req.set_consume_all_before_sending(false);
		let _ = req.read_buf().unwrap();
		assert!(req.write_buffer().is_empty());
	}

	#[test]
	fn streaming_mode_clears_payload_between_reads() {
		let mut resp = parsed_response(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc");
		assert_eq!(resp.payload(), b"abc");
		let _ = resp.write_buffer();
		let _ = resp.read_buf().unwrap();
		assert!(resp.payload().is_empty());
	}

	#[test]
	fn buffering_mode_appends_and_enforces_ceiling() {
		let mut resp = parsed_response(b"HTTP/1.1 200 OK\r\nContent-Length: 99999999\r\n\r\n");
		resp.set_consume_all_before_sending(true);
		let mut total = 0usize;
		loop {
			match resp.read_buf() {
				Ok(buf) => {
					let n = buf.len();
					buf.fill(b'x');
					resp.parse(n).unwrap();
					total += n;
					assert!(total < MAX_BUFFERED_PAYLOAD + READ_CHUNK);
				},
				Err(Error::PayloadTooLarge) => break,
				Err(e) => panic!("unexpected error: {e}"),
			}
		}
	}

	#[test]
	fn upgrade_is_reported_as_error() {
		let mut req = Request::new();
		let err = req
			.feed(b"GET / HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\n\r\n")
			.unwrap_err();
		assert!(matches!(err, Error::Upgrade));
		// Headers were still captured for the passthrough path.
		assert_eq!(req.headers().first(known::HOST), Some("h"));
	}

	#[tokio::test]
	async fn chunked_to_fixed_length_equivalence() {
		let mut resp = Response::new();
		resp.set_consume_all_before_sending(true);
		resp
			.feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
			.unwrap();
		resp.feed(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n").unwrap();
		assert!(resp.payload_complete());
		// The accumulated payload retains chunked framing until finalized.
		assert!(resp.payload().starts_with(b"5\r\nhello"));
		resp.finalize_buffered().await.unwrap();
		assert_eq!(resp.payload(), b"hello world");
		assert_eq!(resp.headers().first(known::CONTENT_LENGTH), Some("11"));
		assert!(!resp.headers().contains(known::TRANSFER_ENCODING));
	}

	#[tokio::test]
	async fn gzip_round_trip() {
		for body in [&b""[..], &b"x"[..], &b"hello hello hello hello"[..]] {
			let mut resp = parsed_response(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
			resp.set_payload(body, false);
			if body.is_empty() {
				// Compressing nothing is a no-op.
				resp.compress_gzip().await.unwrap();
				continue;
			}
			resp.compress_gzip().await.unwrap();
			assert_eq!(
				resp.headers().first(known::CONTENT_ENCODING),
				Some("gzip")
			);
			assert_ne!(resp.payload(), body);
			resp.decompress().await.unwrap();
			assert_eq!(resp.payload(), body);
			assert!(!resp.headers().contains(known::CONTENT_ENCODING));
		}
	}

	#[tokio::test]
	async fn deflate_round_trip() {
		let body = b"the quick brown fox jumps over the lazy dog";
		let mut resp = parsed_response(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
		resp.set_payload(&body[..], false);
		resp.compress_deflate().await.unwrap();
		assert_eq!(
			resp.headers().first(known::CONTENT_ENCODING),
			Some("deflate")
		);
		resp.decompress().await.unwrap();
		assert_eq!(resp.payload(), body);
	}

	#[tokio::test]
	async fn empty_chunked_gzip_response_is_not_an_error() {
		// A 302 that declares chunked gzip and ships an empty body.
		let gzip_empty = compression::encode(b"", compression::GZIP).await.unwrap();
		let mut resp = Response::new();
		resp.set_consume_all_before_sending(true);
		resp
			.feed(
				b"HTTP/1.1 302 Found\r\nLocation: /\r\nContent-Encoding: gzip\r\nTransfer-Encoding: chunked\r\n\r\n",
			)
			.unwrap();
		resp
			.feed(format!("{:x}\r\n", gzip_empty.len()).as_bytes())
			.unwrap();
		resp.feed(&gzip_empty).unwrap();
		resp.feed(b"\r\n0\r\n\r\n").unwrap();
		assert!(resp.payload_complete());
		resp.finalize_buffered().await.unwrap();
		assert!(resp.payload().is_empty());
	}

	#[tokio::test]
	async fn unknown_encoding_is_rejected() {
		let mut resp = parsed_response(
			b"HTTP/1.1 200 OK\r\nContent-Encoding: br\r\nContent-Length: 3\r\n\r\nabc",
		);
		assert!(matches!(
			resp.decompress().await,
			Err(Error::UnsupportedEncoding(_))
		));
	}

	#[test]
	fn content_type_classification() {
		let html = parsed_response(
			b"HTTP/1.1 200 OK\r\nContent-Type: Text/HTML; charset=utf-8\r\nContent-Length: 0\r\n\r\n",
		);
		assert!(html.is_text());
		assert!(html.is_html());
		assert!(!html.is_image());

		let png = parsed_response(
			b"HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: 0\r\n\r\n",
		);
		assert!(png.is_image());
		assert!(!png.is_text());

		let js = parsed_response(
			b"HTTP/1.1 200 OK\r\nContent-Type: application/javascript\r\nContent-Length: 0\r\n\r\n",
		);
		assert!(js.is_javascript());
	}

	#[test]
	fn request_line_is_captured() {
		let req = parsed_request(b"POST /submit?q=1 HTTP/1.0\r\nHost: h\r\n\r\n");
		assert_eq!(req.method(), "POST");
		assert_eq!(req.target(), "/submit?q=1");
		assert_eq!(req.version(), Version::Http10);
	}

	#[test]
	fn status_line_is_captured() {
		let resp = parsed_response(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
		assert_eq!(resp.status(), 404);
		assert_eq!(resp.status_line(), "HTTP/1.1 404 Not Found");
	}
}
