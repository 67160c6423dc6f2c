//! Incremental HTTP/1.x push parser.
//!
//! The header section is accumulated and handed to `httparse` once the
//! terminating CRLFCRLF arrives; body framing (Content-Length, chunked,
//! read-to-EOF) is a hand-driven state machine. The parser is fed once per
//! socket read with exactly the byte count the socket returned, and emits
//! events the owning message folds into its header map and payload buffer.
//!
//! Chunked bodies are reported with their framing (`ChunkHeader` /
//! `ChunkData` / `ChunkComplete`) so the accumulated payload can be re-emitted
//! as a valid chunked stream when the proxy forwards without rewriting.

use bytes::Bytes;

use super::{Error, Version};

const MAX_HEAD_BYTES: usize = super::READ_CHUNK;
const MAX_CHUNK_LINE: usize = 1024;
const MAX_TRAILER_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Kind {
	Request,
	Response,
}

#[derive(Debug)]
pub(crate) enum Event {
	RequestLine {
		method: String,
		target: String,
		version: Version,
	},
	StatusLine {
		code: u16,
		reason: String,
		version: Version,
	},
	Header {
		name: String,
		value: String,
	},
	HeadersComplete {
		upgrade: bool,
	},
	Body(Bytes),
	ChunkHeader(u64),
	ChunkData(Bytes),
	ChunkComplete,
	MessageComplete,
	/// Bytes arrived after the message ended (a pipelined next message). They
	/// are dropped; the owner should refuse to reuse the connection.
	Excess,
}

#[derive(Debug)]
enum State {
	Headers,
	Fixed { remaining: u64 },
	Eof,
	ChunkLine,
	ChunkData { remaining: u64 },
	ChunkDataEnd,
	Trailers,
	/// An upgrade was requested; everything that follows is opaque tunnel
	/// payload that the bridge handles outside the parser.
	Opaque,
	Done,
}

#[derive(Debug)]
pub(crate) struct Parser {
	kind: Kind,
	state: State,
	/// Header-section accumulator; reused for the chunked trailer section.
	head: Vec<u8>,
	/// Scratch for chunk-size lines and inter-chunk CRLFs.
	line: Vec<u8>,
	/// Offset into `head` from which the CRLFCRLF search resumes.
	search_from: usize,
}

impl Parser {
	pub(crate) fn new(kind: Kind) -> Self {
		Self {
			kind,
			state: State::Headers,
			head: Vec::new(),
			line: Vec::new(),
			search_from: 0,
		}
	}

	pub(crate) fn advance(&mut self, input: &[u8], out: &mut Vec<Event>) -> Result<(), Error> {
		let rest = if matches!(self.state, State::Headers) {
			if self.head.len() + input.len() > MAX_HEAD_BYTES {
				return Err(Error::Malformed("header section too large".to_string()));
			}
			self.head.extend_from_slice(input);
			let Some(head_end) = self.find_head_end() else {
				return Ok(());
			};
			self.parse_head(head_end, out)?;
			let rest = Bytes::copy_from_slice(&self.head[head_end..]);
			self.head.clear();
			self.search_from = 0;
			rest
		} else {
			Bytes::copy_from_slice(input)
		};
		self.consume_body(rest, out)
	}

	/// Signal that the peer closed its write side. Read-to-EOF bodies complete
	/// here; anything else mid-message is a truncation.
	pub(crate) fn finish_eof(&mut self, out: &mut Vec<Event>) -> Result<(), Error> {
		match self.state {
			State::Eof => {
				self.state = State::Done;
				out.push(Event::MessageComplete);
				Ok(())
			},
			State::Done | State::Opaque => Ok(()),
			State::Headers if self.head.is_empty() => Ok(()),
			_ => Err(Error::TruncatedMessage),
		}
	}

	fn find_head_end(&mut self) -> Option<usize> {
		let start = self.search_from;
		let found = self.head[start..]
			.windows(4)
			.position(|w| w == b"\r\n\r\n")
			.map(|i| start + i + 4);
		if found.is_none() {
			self.search_from = self.head.len().saturating_sub(3);
		}
		found
	}

	fn parse_head(&mut self, head_end: usize, out: &mut Vec<Event>) -> Result<(), Error> {
		let head = &self.head[..head_end];
		let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];

		let mut upgrade = false;
		let mut chunked = false;
		let mut content_length: Option<u64> = None;
		let mut status_code = 0u16;

		let header_count = match self.kind {
			Kind::Request => {
				let mut req = httparse::Request::new(&mut parsed);
				match req.parse(head) {
					Ok(httparse::Status::Complete(_)) => {},
					Ok(httparse::Status::Partial) => {
						return Err(Error::Malformed("truncated request head".to_string()));
					},
					Err(e) => return Err(Error::Malformed(e.to_string())),
				}
				let version = Version::from_minor(req.version.unwrap_or(1));
				let method = req.method.unwrap_or_default().to_string();
				upgrade |= method.eq_ignore_ascii_case("CONNECT");
				out.push(Event::RequestLine {
					method,
					target: req.path.unwrap_or_default().to_string(),
					version,
				});
				req.headers.len()
			},
			Kind::Response => {
				let mut resp = httparse::Response::new(&mut parsed);
				match resp.parse(head) {
					Ok(httparse::Status::Complete(_)) => {},
					Ok(httparse::Status::Partial) => {
						return Err(Error::Malformed("truncated response head".to_string()));
					},
					Err(e) => return Err(Error::Malformed(e.to_string())),
				}
				let version = Version::from_minor(resp.version.unwrap_or(1));
				status_code = resp.code.unwrap_or(0);
				out.push(Event::StatusLine {
					code: status_code,
					reason: resp.reason.unwrap_or_default().to_string(),
					version,
				});
				resp.headers.len()
			},
		};

		for header in parsed.iter().take(header_count) {
			let name = header.name.to_string();
			let value = String::from_utf8_lossy(header.value).into_owned();
			if name.eq_ignore_ascii_case("transfer-encoding") {
				chunked |= value
					.split(',')
					.any(|tok| tok.trim().eq_ignore_ascii_case("chunked"));
			} else if name.eq_ignore_ascii_case("content-length") {
				let parsed_len: u64 = value
					.trim()
					.parse()
					.map_err(|_| Error::Malformed(format!("bad content-length {value:?}")))?;
				if content_length.is_some_and(|prior| prior != parsed_len) {
					return Err(Error::Malformed("conflicting content-length".to_string()));
				}
				content_length = Some(parsed_len);
			} else if name.eq_ignore_ascii_case("upgrade") {
				upgrade = true;
			}
			out.push(Event::Header { name, value });
		}
		out.push(Event::HeadersComplete { upgrade });

		self.state = if upgrade {
			State::Opaque
		} else if matches!(self.kind, Kind::Response)
			&& (status_code / 100 == 1 || status_code == 204 || status_code == 304)
		{
			out.push(Event::MessageComplete);
			State::Done
		} else if chunked {
			State::ChunkLine
		} else {
			match content_length {
				Some(0) => {
					out.push(Event::MessageComplete);
					State::Done
				},
				Some(n) => State::Fixed { remaining: n },
				None => match self.kind {
					// A request without framing headers has no body.
					Kind::Request => {
						out.push(Event::MessageComplete);
						State::Done
					},
					Kind::Response => State::Eof,
				},
			}
		};
		Ok(())
	}

	fn consume_body(&mut self, mut data: Bytes, out: &mut Vec<Event>) -> Result<(), Error> {
		while !data.is_empty() {
			match &mut self.state {
				State::Headers => unreachable!("body bytes before header completion"),
				State::Fixed { remaining } => {
					let take = (*remaining).min(data.len() as u64) as usize;
					out.push(Event::Body(data.split_to(take)));
					*remaining -= take as u64;
					if *remaining == 0 {
						out.push(Event::MessageComplete);
						self.state = State::Done;
					}
				},
				State::Eof => {
					out.push(Event::Body(data.split_to(data.len())));
				},
				State::ChunkLine => {
					let Some(nl) = data.iter().position(|&b| b == b'\n') else {
						self.line.extend_from_slice(&data);
						data.clear();
						if self.line.len() > MAX_CHUNK_LINE {
							return Err(Error::Malformed("chunk size line too long".to_string()));
						}
						continue;
					};
					self.line.extend_from_slice(&data.split_to(nl + 1));
					if self.line.len() > MAX_CHUNK_LINE {
						return Err(Error::Malformed("chunk size line too long".to_string()));
					}
					let size = parse_chunk_size(&self.line)?;
					self.line.clear();
					out.push(Event::ChunkHeader(size));
					self.state = if size == 0 {
						self.head.clear();
						State::Trailers
					} else {
						State::ChunkData { remaining: size }
					};
				},
				State::ChunkData { remaining } => {
					let take = (*remaining).min(data.len() as u64) as usize;
					out.push(Event::ChunkData(data.split_to(take)));
					*remaining -= take as u64;
					if *remaining == 0 {
						self.state = State::ChunkDataEnd;
					}
				},
				State::ChunkDataEnd => {
					let take = (2 - self.line.len()).min(data.len());
					self.line.extend_from_slice(&data.split_to(take));
					if self.line.len() == 2 {
						if self.line != b"\r\n" {
							return Err(Error::Malformed("missing crlf after chunk".to_string()));
						}
						self.line.clear();
						out.push(Event::ChunkComplete);
						self.state = State::ChunkLine;
					}
				},
				State::Trailers => {
					if self.head.len() + data.len() > MAX_TRAILER_BYTES {
						return Err(Error::Malformed("trailer section too large".to_string()));
					}
					self.head.extend_from_slice(&data);
					data.clear();
					let end = if self.head.starts_with(b"\r\n") {
						Some(2)
					} else {
						self.head
							.windows(4)
							.position(|w| w == b"\r\n\r\n")
							.map(|i| i + 4)
					};
					if let Some(end) = end {
						let leftover = self.head.len() - end;
						self.head.clear();
						out.push(Event::ChunkComplete);
						out.push(Event::MessageComplete);
						self.state = State::Done;
						if leftover > 0 {
							out.push(Event::Excess);
						}
					}
				},
				State::Opaque => {
					data.clear();
				},
				State::Done => {
					data.clear();
					out.push(Event::Excess);
				},
			}
		}
		Ok(())
	}
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, Error> {
	let text = std::str::from_utf8(line)
		.map_err(|_| Error::Malformed("non-ascii chunk size".to_string()))?
		.trim_end_matches(['\r', '\n']);
	let size_part = text.split(';').next().unwrap_or("").trim();
	u64::from_str_radix(size_part, 16)
		.map_err(|_| Error::Malformed(format!("bad chunk size {text:?}")))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn collect(kind: Kind, feeds: &[&[u8]]) -> (Vec<Event>, Result<(), Error>) {
		let mut parser = Parser::new(kind);
		let mut out = Vec::new();
		for feed in feeds {
			if let Err(e) = parser.advance(feed, &mut out) {
				return (out, Err(e));
			}
		}
		(out, Ok(()))
	}

	fn body_of(events: &[Event]) -> Vec<u8> {
		let mut body = Vec::new();
		for ev in events {
			match ev {
				Event::Body(b) | Event::ChunkData(b) => body.extend_from_slice(b),
				_ => {},
			}
		}
		body
	}

	#[test]
	fn fixed_length_request_in_one_read() {
		let (events, res) =
			collect(Kind::Request, &[
				b"POST /up HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello",
			]);
		res.unwrap();
		assert_eq!(body_of(&events), b"hello");
		assert!(matches!(events.last(), Some(Event::MessageComplete)));
	}

	#[test]
	fn headers_split_across_reads() {
		let (events, res) = collect(Kind::Request, &[
			b"GET / HT",
			b"TP/1.1\r\nHo",
			b"st: example.com\r\n",
			b"\r\n",
		]);
		res.unwrap();
		let host = events.iter().find_map(|e| match e {
			Event::Header { name, value } if name == "Host" => Some(value.clone()),
			_ => None,
		});
		assert_eq!(host.as_deref(), Some("example.com"));
		assert!(matches!(events.last(), Some(Event::MessageComplete)));
	}

	#[test]
	fn chunked_response_emits_framing() {
		let (events, res) = collect(Kind::Response, &[
			b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
			b"5\r\nhello\r\n",
			b"6\r\n world\r\n",
			b"0\r\n\r\n",
		]);
		res.unwrap();
		assert_eq!(body_of(&events), b"hello world");
		let chunk_headers: Vec<u64> = events
			.iter()
			.filter_map(|e| match e {
				Event::ChunkHeader(n) => Some(*n),
				_ => None,
			})
			.collect();
		assert_eq!(chunk_headers, vec![5, 6, 0]);
		assert!(matches!(events.last(), Some(Event::MessageComplete)));
	}

	#[test]
	fn chunked_body_split_mid_size_line() {
		let (events, res) = collect(Kind::Response, &[
			b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nb",
			b"\r\nhello",
			b" world\r\n0\r\n\r\n",
		]);
		res.unwrap();
		assert_eq!(body_of(&events), b"hello world");
	}

	#[test]
	fn chunked_trailers_are_discarded() {
		let (events, res) = collect(Kind::Response, &[
			b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
			b"3\r\nabc\r\n0\r\nX-Checksum: 1\r\n\r\n",
		]);
		res.unwrap();
		assert_eq!(body_of(&events), b"abc");
		assert!(matches!(events.last(), Some(Event::MessageComplete)));
	}

	#[test]
	fn response_without_framing_reads_to_eof() {
		let mut parser = Parser::new(Kind::Response);
		let mut out = Vec::new();
		parser
			.advance(b"HTTP/1.0 200 OK\r\n\r\npartial", &mut out)
			.unwrap();
		assert!(!out.iter().any(|e| matches!(e, Event::MessageComplete)));
		parser.advance(b" body", &mut out).unwrap();
		parser.finish_eof(&mut out).unwrap();
		assert_eq!(body_of(&out), b"partial body");
		assert!(matches!(out.last(), Some(Event::MessageComplete)));
	}

	#[test]
	fn eof_mid_fixed_body_is_truncation() {
		let mut parser = Parser::new(Kind::Response);
		let mut out = Vec::new();
		parser
			.advance(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc", &mut out)
			.unwrap();
		assert!(matches!(
			parser.finish_eof(&mut out),
			Err(Error::TruncatedMessage)
		));
	}

	#[test]
	fn status_204_has_no_body() {
		let (events, res) = collect(Kind::Response, &[b"HTTP/1.1 204 No Content\r\n\r\n"]);
		res.unwrap();
		assert!(matches!(events.last(), Some(Event::MessageComplete)));
	}

	#[test]
	fn upgrade_flag_is_reported() {
		let (events, res) = collect(Kind::Request, &[
			b"GET /chat HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
		]);
		res.unwrap();
		assert!(
			events
				.iter()
				.any(|e| matches!(e, Event::HeadersComplete { upgrade: true }))
		);
	}

	#[test]
	fn garbage_is_malformed() {
		let (_, res) = collect(Kind::Request, &[b"\x16\x03\x01\x02\x00garbage beyond\r\n\r\n"]);
		assert!(matches!(res, Err(Error::Malformed(_))));
	}

	#[test]
	fn pipelined_bytes_flag_excess() {
		let (events, res) = collect(Kind::Request, &[
			b"GET / HTTP/1.1\r\nHost: h\r\n\r\nGET /next HTTP/1.1\r\n",
		]);
		res.unwrap();
		assert!(events.iter().any(|e| matches!(e, Event::Excess)));
	}

	#[test]
	fn conflicting_content_length_is_malformed() {
		let (_, res) = collect(Kind::Request, &[
			b"POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n",
		]);
		assert!(matches!(res, Err(Error::Malformed(_))));
	}

	#[test]
	fn bad_chunk_size_is_malformed() {
		let (_, res) = collect(Kind::Response, &[
			b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n",
		]);
		assert!(matches!(res, Err(Error::Malformed(_))));
	}
}
