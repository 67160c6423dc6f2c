//! The per-connection bridge: transparently fulfills the downstream client's
//! request against the true origin, interposing the policy hooks on every
//! transaction.
//!
//! Control flow for a TLS client: peek the raw socket for the ClientHello and
//! pull the hostname out of its SNI extension, resolve and connect upstream,
//! complete the origin handshake (verifying its certificate), have the store
//! spoof a server config from the verified leaf, complete the downstream
//! handshake with it, then run the HTTP transaction loop. Plain clients skip
//! straight to the transaction loop, resolving the origin from the Host
//! header of the first request. Traffic that turns out not to be HTTP we can
//! interpose on is shuttled verbatim by the passthrough volley.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use super::policy::Verdict;
use super::{Error, KillSwitch, Shared, strip};
use crate::http::preview::{self, Preview};
use crate::http::{self, Message, Request, Response, known};
use crate::tls::sni;
use crate::transport::Stream;

/// RFC 6066 caps the SNI payload at 2^14 bytes; peeking that much is always
/// enough to reach the extension.
const PREVIEW_BUFFER: usize = 16384;
/// Minimum bytes before even a minimal HTTP request line can be classified.
const MIN_PREVIEW: usize = 18;
const VOLLEY_BUFFER: usize = 1_638_400;

pub(crate) struct Bridge {
	shared: Arc<Shared>,
	kill: Arc<KillSwitch>,
}

enum Flow {
	Done,
	Passthrough { prelude: Vec<u8> },
}

enum Txn {
	KeepAlive,
	Close,
	Upgrade { host: String, prelude: Vec<u8> },
}

impl Bridge {
	pub(crate) fn new(shared: Arc<Shared>) -> Self {
		Self {
			shared,
			kill: Arc::new(KillSwitch::new()),
		}
	}

	pub(crate) async fn run_plain(self, socket: TcpStream, peer: SocketAddr) -> Result<(), Error> {
		debug!(%peer, "plain client accepted");
		socket.set_nodelay(true).ok();
		Conversation {
			shared: self.shared,
			kill: self.kill,
			down: socket.into(),
			up: None,
			pinned_host: None,
			is_tls: false,
		}
		.run()
		.await
	}

	pub(crate) async fn run_tls(self, socket: TcpStream, peer: SocketAddr) -> Result<(), Error> {
		debug!(%peer, "tls client accepted");
		let t = self.shared.stream_timeout;
		socket.set_nodelay(true).ok();

		// Peek, never consume: the ClientHello must stay queued for the real
		// handshake once the spoofed context is ready.
		let mut hello = vec![0u8; PREVIEW_BUFFER];
		let n = io(t, "client hello peek", socket.peek(&mut hello)).await?;
		let host = sni::extract_host(&hello[..n]).ok_or(Error::NoSni)?;
		debug!(%peer, host, "sni hostname extracted");

		let port = self.shared.tls_upstream_port;
		let upstream_tcp = io(t, "upstream connect", connect_all(&host, port)).await?;
		upstream_tcp.set_nodelay(true).ok();

		let server_name =
			ServerName::try_from(host.clone()).map_err(|_| Error::BadHostname(host.clone()))?;
		let connector = TlsConnector::from(self.shared.upstream_tls.clone());
		// Verification happens inside the handshake; an origin that fails it
		// is never spoofed, the client just sees a dead connection.
		let up_tls = io(t, "upstream handshake", connector.connect(server_name, upstream_tcp))
			.await
			.inspect_err(|e| warn!(host, "upstream tls handshake failed: {e}"))?;

		let leaf = up_tls
			.get_ref()
			.1
			.peer_certificates()
			.and_then(|certs| certs.first())
			.map(|cert| cert.clone().into_owned())
			.ok_or(Error::MissingUpstreamLeaf)?;
		let spoofed = self.shared.store.server_config(&host, &leaf)?;

		let acceptor = TlsAcceptor::from(spoofed);
		let down_tls = io(t, "downstream handshake", acceptor.accept(socket)).await?;

		Conversation {
			shared: self.shared,
			kill: self.kill,
			down: down_tls.into(),
			up: Some(up_tls.into()),
			pinned_host: Some(host.to_ascii_lowercase()),
			is_tls: true,
		}
		.run()
		.await
	}
}

struct Conversation {
	shared: Arc<Shared>,
	kill: Arc<KillSwitch>,
	down: Stream,
	up: Option<Stream>,
	/// Origin host this bridge is locked to. A keep-alive request naming a
	/// different host terminates the bridge rather than silently re-routing.
	pinned_host: Option<String>,
	is_tls: bool,
}

impl Conversation {
	async fn run(mut self) -> Result<(), Error> {
		match self.drive().await {
			Ok(Flow::Passthrough { prelude }) => self.into_passthrough(prelude).await,
			Ok(Flow::Done) => {
				self.teardown().await;
				Ok(())
			},
			Err(e) => {
				self.teardown().await;
				Err(e)
			},
		}
	}

	async fn drive(&mut self) -> Result<Flow, Error> {
		let t = self.shared.stream_timeout;
		let mut preview_buf = vec![0u8; PREVIEW_BUFFER];
		loop {
			// Classify the first bytes of the (possibly decrypted) stream
			// before committing to HTTP parsing.
			let mut filled = 0usize;
			let classified = loop {
				if filled == preview_buf.len() {
					return Err(http::Error::Malformed("oversized request preview".to_string()).into());
				}
				let n = read_some(
					t,
					"client preview read",
					&mut self.down,
					&mut preview_buf[filled..],
				)
				.await?;
				if n == 0 {
					if filled == 0 {
						// Clean close between transactions.
						return Ok(Flow::Done);
					}
					return Err(http::Error::TruncatedMessage.into());
				}
				filled += n;
				if filled < MIN_PREVIEW {
					continue;
				}
				match preview::classify(&preview_buf[..filled])? {
					Preview::Incomplete => continue,
					other => break other,
				}
			};

			match classified {
				Preview::Incomplete => unreachable!("incomplete preview escaped the read loop"),
				Preview::NotHttp => {
					if !self.is_tls {
						// No Host header, no SNI: no way to find the origin.
						return Err(Error::UnknownProtocol);
					}
					return Ok(Flow::Passthrough {
						prelude: preview_buf[..filled].to_vec(),
					});
				},
				Preview::UpgradeHttp { host } => {
					self.ensure_upstream(&host).await?;
					return Ok(Flow::Passthrough {
						prelude: preview_buf[..filled].to_vec(),
					});
				},
				Preview::Http { .. } => match self.transaction(&preview_buf[..filled]).await? {
					Txn::KeepAlive => continue,
					Txn::Close => return Ok(Flow::Done),
					Txn::Upgrade { host, prelude } => {
						self.ensure_upstream(&host).await?;
						return Ok(Flow::Passthrough { prelude });
					},
				},
			}
		}
	}

	/// One full request/response exchange.
	async fn transaction(&mut self, initial: &[u8]) -> Result<Txn, Error> {
		let t = self.shared.stream_timeout;
		let mut req = Request::new();
		let mut client_eof = false;

		// Raw copy of the request head in case a late Upgrade header sends us
		// to the passthrough volley instead.
		let mut prelude = initial.to_vec();
		match req.feed(initial) {
			Ok(()) => {},
			Err(http::Error::Upgrade) => return self.late_upgrade(req, prelude),
			Err(e) => return Err(e.into()),
		}
		let mut header_chunk = vec![0u8; http::READ_CHUNK];
		while !req.headers_complete() {
			let n = read_some(t, "request headers read", &mut self.down, &mut header_chunk).await?;
			if n == 0 {
				req.finish_eof()?;
				client_eof = true;
				break;
			}
			prelude.extend_from_slice(&header_chunk[..n]);
			match req.feed(&header_chunk[..n]) {
				Ok(()) => {},
				Err(http::Error::Upgrade) => return self.late_upgrade(req, prelude),
				Err(e) => return Err(e.into()),
			}
		}
		drop(header_chunk);
		drop(prelude);

		// Policy sees the request before any upstream work happens, so a
		// blocked request never even resolves the origin.
		match self
			.shared
			.policy
			.on_message_begin(&req.head_bytes(), None, None, None)
		{
			Verdict::Allow => {
				req.set_should_block(0);
				req.set_consume_all_before_sending(false);
			},
			Verdict::Inspect => req.set_consume_all_before_sending(true),
			Verdict::Whitelist => {
				req.set_should_block(-1);
				req.set_consume_all_before_sending(false);
			},
			Verdict::Block(replacement) => {
				self.write_block(&mut req, replacement, 1).await?;
				return Ok(Txn::Close);
			},
		}
		strip::sanitize_request(&mut req);

		let host_header = req
			.headers()
			.first(known::HOST)
			.ok_or(Error::MissingHost)?
			.to_string();
		let (host, port) = split_host_port(
			&host_header,
			if self.is_tls {
				self.shared.tls_upstream_port
			} else {
				80
			},
		);
		match &self.pinned_host {
			Some(pinned) => {
				if !pinned.eq_ignore_ascii_case(&host) {
					return Err(Error::HostChanged {
						expected: pinned.clone(),
						got: host,
					});
				}
			},
			None => self.connect_upstream(&host, port).await?,
		}

		// Inspected requests are buffered, normalized and re-judged before a
		// single byte reaches the origin.
		if req.consume_all_before_sending() && !req.payload_complete() && !client_eof {
			client_eof =
				read_until_complete(t, "request body read", &mut self.down, &mut req).await?;
		}
		if req.consume_all_before_sending() && req.payload_complete() {
			req.finalize_buffered().await?;
			let decision =
				self
					.shared
					.policy
					.on_message_end(&req.head_bytes(), req.payload(), None, None);
			if decision.block {
				self.write_block(&mut req, decision.replacement, 1).await?;
				return Ok(Txn::Close);
			}
			if let Some(replacement) = decision.replacement {
				req.set_payload(replacement, false);
			}
		}

		// Forward the request, streaming any remainder.
		let wire = req.write_buffer();
		io(t, "request write", self.upstream()?.write_all(&wire)).await?;
		while !req.payload_complete() && !client_eof {
			let n = {
				let buf = req.read_buf()?;
				read_some(t, "request body read", &mut self.down, buf).await?
			};
			if n == 0 {
				req.finish_eof()?;
				client_eof = true;
				break;
			}
			req.parse(n)?;
			let wire = req.write_buffer();
			io(t, "request write", self.upstream()?.write_all(&wire)).await?;
		}

		// Response headers.
		let mut resp = Response::new();
		let mut upstream_eof = false;
		while !resp.headers_complete() {
			let n = {
				let buf = resp.read_buf()?;
				read_some(t, "response headers read", self.upstream()?, buf).await?
			};
			if n == 0 {
				resp.finish_eof()?;
				upstream_eof = true;
				break;
			}
			resp.parse(n)?;
		}
		if !resp.headers_complete() {
			return Err(http::Error::TruncatedMessage.into());
		}

		// Re-judge with the response headers on the table, unless the request
		// phase whitelisted the whole transaction.
		if req.should_block() > -1 {
			match self.shared.policy.on_message_begin(
				&req.head_bytes(),
				None,
				Some(&resp.head_bytes()),
				None,
			) {
				Verdict::Allow => resp.set_consume_all_before_sending(false),
				Verdict::Inspect => resp.set_consume_all_before_sending(true),
				Verdict::Whitelist => {
					req.set_should_block(-1);
					resp.set_should_block(-1);
					resp.set_consume_all_before_sending(false);
				},
				Verdict::Block(replacement) => {
					resp.set_should_block(1);
					self.write_block(&mut req, replacement, 1).await?;
					return Ok(Txn::Close);
				},
			}
		}
		strip::sanitize_response(&mut resp);
		// The server has the final say on connection reuse.
		let keep_alive = decide_keep_alive(&resp);

		if resp.consume_all_before_sending() {
			if !resp.payload_complete() && !upstream_eof {
				upstream_eof =
					read_until_complete(t, "response body read", self.upstream()?, &mut resp)
						.await?;
			}
			// Normalize for inspection: dechunk, then decode. Failure here is
			// fatal; the inspected body was promised decoded.
			resp.finalize_buffered().await?;

			if resp.is_text() {
				let content_type = resp
					.headers()
					.first(known::CONTENT_TYPE)
					.unwrap_or_default()
					.to_string();
				let category = self
					.shared
					.policy
					.classify_content(resp.payload(), &content_type);
				if category != 0 {
					resp.set_should_block(i32::from(category));
					self
						.write_block(&mut req, None, i32::from(category))
						.await?;
					return Ok(Txn::Close);
				}
			}

			let decision = self.shared.policy.on_message_end(
				&req.head_bytes(),
				req.payload(),
				Some(&resp.head_bytes()),
				Some(resp.payload()),
			);
			if decision.block {
				resp.set_should_block(1);
				self.write_block(&mut req, decision.replacement, 1).await?;
				return Ok(Txn::Close);
			}
			if let Some(replacement) = decision.replacement {
				resp.set_payload(replacement, false);
			}
			let wire = resp.write_buffer();
			io(t, "response write", self.down.write_all(&wire)).await?;
		} else {
			// Streaming: forward as it arrives, clearing between reads.
			let wire = resp.write_buffer();
			io(t, "response write", self.down.write_all(&wire)).await?;
			while !resp.payload_complete() {
				if upstream_eof {
					return Err(http::Error::TruncatedMessage.into());
				}
				let n = {
					let buf = resp.read_buf()?;
					read_some(t, "response body read", self.upstream()?, buf).await?
				};
				if n == 0 {
					resp.finish_eof()?;
					upstream_eof = true;
				} else {
					resp.parse(n)?;
				}
				let wire = resp.write_buffer();
				if !wire.is_empty() {
					io(t, "response write", self.down.write_all(&wire)).await?;
				}
			}
		}

		// Blocked means a category >= 1; whitelisted (-1) transactions were
		// never interrupted and may reuse the connection.
		let reusable = keep_alive
			&& !client_eof
			&& !upstream_eof
			&& req.should_block() < 1
			&& resp.should_block() < 1
			&& !req.saw_excess()
			&& !resp.saw_excess();
		Ok(if reusable { Txn::KeepAlive } else { Txn::Close })
	}

	fn late_upgrade(&self, req: Request, prelude: Vec<u8>) -> Result<Txn, Error> {
		let host = req
			.headers()
			.first(known::HOST)
			.ok_or(Error::MissingHost)?
			.to_string();
		debug!(host, "upgrade requested past the preview; falling back to passthrough");
		Ok(Txn::Upgrade { host, prelude })
	}

	/// Write a block response (a canned page or a synthesized 204) downstream
	/// in place of whatever the origin would have said.
	async fn write_block(
		&mut self,
		req: &mut Request,
		replacement: Option<Bytes>,
		category: i32,
	) -> Result<(), Error> {
		let t = self.shared.stream_timeout;
		match replacement {
			Some(body) => req.set_payload(body, true),
			None => req.make_204(),
		}
		req.set_should_block(category.max(1));
		let wire = req.write_buffer();
		io(t, "block write", self.down.write_all(&wire)).await?;
		Ok(())
	}

	async fn ensure_upstream(&mut self, host_header: &str) -> Result<(), Error> {
		if self.up.is_some() {
			return Ok(());
		}
		let (host, port) = split_host_port(host_header, 80);
		self.connect_upstream(&host, port).await
	}

	async fn connect_upstream(&mut self, host: &str, port: u16) -> Result<(), Error> {
		let t = self.shared.stream_timeout;
		let socket = io(t, "upstream connect", connect_all(host, port)).await?;
		socket.set_nodelay(true).ok();
		self.up = Some(Stream::Tcp(socket));
		self.pinned_host = Some(host.to_ascii_lowercase());
		Ok(())
	}

	fn upstream(&mut self) -> Result<&mut Stream, Error> {
		match self.up.as_mut() {
			Some(up) => Ok(up),
			None => Err(std::io::Error::from(std::io::ErrorKind::NotConnected).into()),
		}
	}

	/// Shuttle raw bytes both ways until either side closes or the liveness
	/// bound expires. Used for WebSocket upgrades and unknown TLS-wrapped
	/// protocols.
	async fn into_passthrough(mut self, prelude: Vec<u8>) -> Result<(), Error> {
		let t = self.shared.stream_timeout;
		debug!("entering passthrough volley");
		{
			let up = self.upstream()?;
			io(t, "passthrough prelude write", up.write_all(&prelude)).await?;
		}
		let Conversation { kill, down, up, .. } = self;
		let Some(up) = up else {
			return Err(std::io::Error::from(std::io::ErrorKind::NotConnected).into());
		};
		let (down_read, down_write) = tokio::io::split(down);
		let (up_read, up_write) = tokio::io::split(up);
		let client_to_origin = volley(down_read, up_write, kill.clone(), t, "client to origin");
		let origin_to_client = volley(up_read, down_write, kill.clone(), t, "origin to client");
		let (a, b) = tokio::join!(client_to_origin, origin_to_client);
		a.and(b)
	}

	async fn teardown(&mut self) {
		self.kill.kill();
		let _ = self.down.shutdown().await;
		if let Some(up) = self.up.as_mut() {
			let _ = up.shutdown().await;
		}
	}
}

/// Bound a suspendable operation with the bridge's liveness timeout.
async fn io<T, E>(
	t: Duration,
	stage: &'static str,
	fut: impl Future<Output = Result<T, E>>,
) -> Result<T, Error>
where
	E: Into<Error>,
{
	match timeout(t, fut).await {
		Ok(Ok(value)) => Ok(value),
		Ok(Err(e)) => Err(e.into()),
		Err(_) => Err(Error::TimedOut(stage)),
	}
}

/// Read with EOF normalization: a peer that drops TLS without close_notify
/// reads as a plain EOF here, and the message parser decides whether that was
/// a tolerable "dumb server" close or a truncation attack.
async fn read_some(
	t: Duration,
	stage: &'static str,
	stream: &mut Stream,
	buf: &mut [u8],
) -> Result<usize, Error> {
	match io(t, stage, stream.read(buf)).await {
		Ok(n) => Ok(n),
		Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
			warn!(stage, "peer closed without a proper tls shutdown");
			Ok(0)
		},
		Err(e) => Err(e),
	}
}

async fn read_until_complete(
	t: Duration,
	stage: &'static str,
	stream: &mut Stream,
	msg: &mut Message,
) -> Result<bool, Error> {
	let mut eof = false;
	while !msg.payload_complete() {
		let n = {
			let buf = msg.read_buf()?;
			read_some(t, stage, stream, buf).await?
		};
		if n == 0 {
			msg.finish_eof()?;
			eof = true;
			break;
		}
		msg.parse(n)?;
	}
	Ok(eof)
}

/// Resolve and connect, trying every returned address before giving up.
async fn connect_all(host: &str, port: u16) -> Result<TcpStream, Error> {
	let addrs = lookup_host((host, port)).await.map_err(|e| {
		debug!(host, port, "resolution failed: {e}");
		Error::Unreachable {
			host: host.to_string(),
			port,
		}
	})?;
	let mut last_err: Option<std::io::Error> = None;
	for addr in addrs {
		match TcpStream::connect(addr).await {
			Ok(socket) => return Ok(socket),
			Err(e) => {
				debug!(%addr, "connect attempt failed: {e}");
				last_err = Some(e);
			},
		}
	}
	Err(match last_err {
		Some(e) => e.into(),
		None => Error::Unreachable {
			host: host.to_string(),
			port,
		},
	})
}

async fn volley<R, W>(
	mut reader: R,
	mut writer: W,
	kill: Arc<KillSwitch>,
	t: Duration,
	direction: &'static str,
) -> Result<(), Error>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut buf = vec![0u8; VOLLEY_BUFFER];
	loop {
		let n = tokio::select! {
			_ = kill.wait() => return Ok(()),
			read = timeout(t, reader.read(&mut buf)) => match read {
				Err(_) => {
					kill.kill();
					return Err(Error::TimedOut("passthrough read"));
				},
				Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => 0,
				Ok(Err(e)) => {
					kill.kill();
					return Err(e.into());
				},
				Ok(Ok(n)) => n,
			},
		};
		if n == 0 {
			debug!(direction, "passthrough peer closed");
			let _ = writer.shutdown().await;
			kill.kill();
			return Ok(());
		}
		tokio::select! {
			_ = kill.wait() => return Ok(()),
			wrote = timeout(t, writer.write_all(&buf[..n])) => match wrote {
				Err(_) => {
					kill.kill();
					return Err(Error::TimedOut("passthrough write"));
				},
				Ok(Err(e)) => {
					kill.kill();
					return Err(e.into());
				},
				Ok(Ok(())) => {},
			},
		}
	}
}

/// Split an optional port off a Host header value. A malformed port is
/// reported and the default assumed, matching how lenient clients behave.
fn split_host_port(raw: &str, default_port: u16) -> (String, u16) {
	let raw = raw.trim();
	if let Some(rest) = raw.strip_prefix('[') {
		if let Some((host, after)) = rest.split_once(']') {
			let port = after.strip_prefix(':').and_then(|p| p.parse().ok());
			return (host.to_string(), port.unwrap_or(default_port));
		}
	}
	match raw.rsplit_once(':') {
		Some((host, port)) if !host.contains(':') => match port.parse::<u16>() {
			Ok(port) => (host.to_string(), port),
			Err(_) => {
				warn!(raw, "failed to parse port in host header, assuming {default_port}");
				(host.to_string(), default_port)
			},
		},
		_ => (raw.to_string(), default_port),
	}
}

fn decide_keep_alive(resp: &Response) -> bool {
	let mut saw_close = false;
	let mut saw_keep_alive = false;
	for value in resp.headers().get(known::CONNECTION) {
		for token in value.split(',') {
			let token = token.trim();
			if token.eq_ignore_ascii_case("close") {
				saw_close = true;
			} else if token.eq_ignore_ascii_case("keep-alive") {
				saw_keep_alive = true;
			}
		}
	}
	if saw_close {
		return false;
	}
	match resp.version() {
		http::Version::Http10 => saw_keep_alive,
		_ => true,
	}
}
