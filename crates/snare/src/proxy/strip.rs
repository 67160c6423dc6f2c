//! The one auditable list of headers the proxy forcibly rewrites on every
//! intercepted transaction. These are hostile-by-design edits: they stop
//! clients and origins from negotiating compression we cannot decode (SDCH),
//! transports we cannot intercept (QUIC / alternative protocols), and key
//! pinning that would outlaw our forged certificates.

use crate::http::known::*;
use crate::http::{Request, Response};

pub(crate) const STRIPPED_REQUEST_HEADERS: &[&str] = &[
	X_SDCH,
	AVAIL_DICTIONARY,
	GET_DICTIONARY,
	ALTERNATE_PROTOCOL,
	ALT_SVC,
	PUBLIC_KEY_PINS,
	PUBLIC_KEY_PINS_REPORT_ONLY,
];

pub(crate) const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
	GET_DICTIONARY,
	ALTERNATE_PROTOCOL,
	ALT_SVC,
	PUBLIC_KEY_PINS,
	PUBLIC_KEY_PINS_REPORT_ONLY,
];

/// Applied to every intercepted request before it is forwarded upstream.
pub(crate) fn sanitize_request(req: &mut Request) {
	// Pin the accepted encodings to one we can decode.
	req.headers_mut().add(ACCEPT_ENCODING, "gzip", true);
	for name in STRIPPED_REQUEST_HEADERS {
		req.headers_mut().remove(name);
	}
}

/// Applied to every intercepted response before it is written downstream.
pub(crate) fn sanitize_response(resp: &mut Response) {
	for name in STRIPPED_RESPONSE_HEADERS {
		resp.headers_mut().remove(name);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_rewrites() {
		let mut req = Request::new();
		req.feed(
			b"GET / HTTP/1.1\r\nHost: h\r\nAccept-Encoding: br, zstd\r\nAlt-Svc: h3=\":443\"\r\nX-SDCH: 1\r\nPublic-Key-Pins: pin\r\n\r\n",
		)
		.unwrap();
		sanitize_request(&mut req);
		let values: Vec<&str> = req.headers().get(ACCEPT_ENCODING).collect();
		assert_eq!(values, vec!["gzip"]);
		for name in STRIPPED_REQUEST_HEADERS {
			assert!(!req.headers().contains(name), "{name} survived");
		}
		assert!(req.headers().contains(HOST));
	}

	#[test]
	fn response_rewrites() {
		let mut resp = Response::new();
		resp.feed(
			b"HTTP/1.1 200 OK\r\nAlt-Svc: h3=\":443\"\r\nAlternate-Protocol: quic\r\nContent-Length: 0\r\n\r\n",
		)
		.unwrap();
		sanitize_response(&mut resp);
		for name in STRIPPED_RESPONSE_HEADERS {
			assert!(!resp.headers().contains(name), "{name} survived");
		}
	}
}
