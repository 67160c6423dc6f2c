//! The hook surface by which an external filtering engine decides the fate of
//! each intercepted message. All hooks are synchronous and must not block.

use bytes::Bytes;

/// Action selected after a message's headers are parsed, before any byte of
/// it is forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
	/// Forward as-is, streaming the body through.
	Allow,
	/// Buffer the entire body (dechunked and decoded) and ask again via
	/// [`Policy::on_message_end`] before forwarding.
	Inspect,
	/// Refuse the transaction. The payload, when given, is a complete
	/// wire-form response written downstream in place of the origin's answer;
	/// otherwise a 204 is synthesized.
	Block(Option<Bytes>),
	/// Allow and never inspect any part of this transaction again, response
	/// included.
	Whitelist,
}

/// Outcome of a full-body inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
	pub block: bool,
	/// With `block`, a complete wire-form response replacing the blocked one;
	/// without it, a replacement body for the message being forwarded.
	pub replacement: Option<Bytes>,
}

/// Implemented by the filtering engine. Header arguments are the wire form of
/// the start line plus header section; body arguments are decoded payloads.
pub trait Policy: Send + Sync {
	/// Fired once per request and once per response, as soon as the headers
	/// are parsed and before anything is forwarded. The response pair is
	/// present only on the response firing.
	fn on_message_begin(
		&self,
		req_headers: &[u8],
		req_body: Option<&[u8]>,
		resp_headers: Option<&[u8]>,
		resp_body: Option<&[u8]>,
	) -> Verdict;

	/// Fired when every side flagged for inspection has been fully buffered
	/// and decoded. The response pair is absent when only the request was
	/// inspected.
	fn on_message_end(
		&self,
		req_headers: &[u8],
		req_body: &[u8],
		resp_headers: Option<&[u8]>,
		resp_body: Option<&[u8]>,
	) -> Decision;

	/// Categorize a complete, decoded, text-like response body. A nonzero
	/// category blocks the transaction; the engine returns zero for
	/// categories it has not enabled.
	fn classify_content(&self, _body: &[u8], _content_type: &str) -> u8 {
		0
	}
}

/// Pass-everything policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Policy for AllowAll {
	fn on_message_begin(
		&self,
		_req_headers: &[u8],
		_req_body: Option<&[u8]>,
		_resp_headers: Option<&[u8]>,
		_resp_body: Option<&[u8]>,
	) -> Verdict {
		Verdict::Allow
	}

	fn on_message_end(
		&self,
		_req_headers: &[u8],
		_req_body: &[u8],
		_resp_headers: Option<&[u8]>,
		_resp_body: Option<&[u8]>,
	) -> Decision {
		Decision::default()
	}
}
