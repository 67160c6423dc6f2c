//! Listener setup and per-connection bridge lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::tls::Store;
use crate::{Config, http, tls};

pub(crate) mod bridge;
pub mod policy;
pub(crate) mod strip;

pub use policy::Policy;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Http(#[from] http::Error),
	#[error(transparent)]
	Tls(#[from] tls::Error),
	#[error("timed out during {0}")]
	TimedOut(&'static str),
	#[error("no sni hostname in client hello")]
	NoSni,
	#[error("could not connect to {host}:{port}")]
	Unreachable { host: String, port: u16 },
	#[error("request host {got:?} does not match connected host {expected:?}")]
	HostChanged { expected: String, got: String },
	#[error("non-http traffic on the plain listener")]
	UnknownProtocol,
	#[error("upstream presented no certificate")]
	MissingUpstreamLeaf,
	#[error("request carries no host header")]
	MissingHost,
	#[error("invalid upstream hostname {0:?}")]
	BadHostname(String),
}

/// One-shot, concurrency-safe termination flag. Whoever wins the race to
/// [`KillSwitch::kill`] owns teardown; everyone else observes it, either by
/// polling or by awaiting [`KillSwitch::wait`].
#[derive(Debug, Default)]
pub struct KillSwitch {
	killed: AtomicBool,
	token: CancellationToken,
}

impl KillSwitch {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns true for exactly one caller, no matter how many race.
	pub fn kill(&self) -> bool {
		let first = !self.killed.swap(true, Ordering::AcqRel);
		if first {
			self.token.cancel();
		}
		first
	}

	pub fn killed(&self) -> bool {
		self.killed.load(Ordering::Acquire)
	}

	pub async fn wait(&self) {
		self.token.cancelled().await
	}
}

/// Shared, per-process state handed to every bridge.
pub(crate) struct Shared {
	pub(crate) store: Arc<Store>,
	pub(crate) upstream_tls: Arc<rustls::ClientConfig>,
	pub(crate) policy: Arc<dyn Policy>,
	pub(crate) stream_timeout: Duration,
	pub(crate) tls_upstream_port: u16,
}

/// The bound listeners. Accepted plain-port connections get a plain bridge;
/// accepted TLS-port connections get a TLS bridge that spoofs a server
/// certificate before reading any request.
pub struct Proxy {
	http_addr: SocketAddr,
	tls_addr: SocketAddr,
	store: Arc<Store>,
	handles: Vec<JoinHandle<()>>,
}

impl Proxy {
	pub async fn bind(cfg: Config, policy: Arc<dyn Policy>) -> Result<Self, Error> {
		let store = Arc::new(Store::new(
			&cfg.ca.country,
			&cfg.ca.organization,
			&cfg.ca.common_name,
		)?);
		Self::bind_with_store(cfg, policy, store).await
	}

	pub async fn bind_with_store(
		cfg: Config,
		policy: Arc<dyn Policy>,
		store: Arc<Store>,
	) -> Result<Self, Error> {
		let upstream_tls = tls::upstream_client_config(cfg.ca_bundle.as_deref())?;
		let shared = Arc::new(Shared {
			store: store.clone(),
			upstream_tls,
			policy,
			stream_timeout: cfg.stream_timeout,
			tls_upstream_port: cfg.tls_upstream_port,
		});

		let http_listener = TcpListener::bind(cfg.http_addr).await?;
		let tls_listener = TcpListener::bind(cfg.tls_addr).await?;
		let http_addr = http_listener.local_addr()?;
		let tls_addr = tls_listener.local_addr()?;
		info!(%http_addr, %tls_addr, "proxy listening");

		let handles = vec![
			tokio::spawn(accept_loop(http_listener, shared.clone(), false)),
			tokio::spawn(accept_loop(tls_listener, shared, true)),
		];

		Ok(Self {
			http_addr,
			tls_addr,
			store,
			handles,
		})
	}

	pub fn http_addr(&self) -> SocketAddr {
		self.http_addr
	}

	pub fn tls_addr(&self) -> SocketAddr {
		self.tls_addr
	}

	pub fn store(&self) -> &Arc<Store> {
		&self.store
	}
}

impl Drop for Proxy {
	fn drop(&mut self) {
		for handle in &self.handles {
			handle.abort();
		}
	}
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, tls: bool) {
	loop {
		let (socket, peer) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!("accept failed: {e}");
				continue;
			},
		};
		let shared = shared.clone();
		tokio::spawn(async move {
			let result = if tls {
				bridge::Bridge::new(shared).run_tls(socket, peer).await
			} else {
				bridge::Bridge::new(shared).run_plain(socket, peer).await
			};
			match result {
				Ok(()) => debug!(%peer, "bridge finished"),
				// Expiry of the liveness bound is routine, not an error.
				Err(Error::TimedOut(stage)) => debug!(%peer, stage, "bridge timed out"),
				Err(e) => error!(%peer, "bridge failed: {e}"),
			}
		});
	}
}
