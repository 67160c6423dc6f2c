//! TLS plumbing: the spoofing certificate store, the hand-rolled ClientHello
//! SNI extractor, and the upstream (origin-facing) client configuration.

use std::path::Path;
use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::CertificateDer;
use rustls_pki_types::pem::PemObject;
use tracing::warn;

pub mod sni;
pub mod store;

pub use store::Store;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("certificate generation failed: {0}")]
	Generate(#[from] rcgen::Error),
	#[error("unable to read upstream certificate: {0}")]
	BadUpstreamLeaf(String),
	#[error("unusable spoofed private key: {0}")]
	BadKey(String),
	#[error("a server context already exists for every name on this certificate")]
	AmbiguousSpoof,
	#[error("tls configuration rejected: {0}")]
	Tls(#[from] rustls::Error),
	#[error("invalid ca bundle: {0}")]
	CaBundle(String),
	#[error("no usable trust roots for upstream verification")]
	NoTrustRoots,
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// Build the client configuration used for origin connections. Server
/// certificates are verified against the supplied PEM bundle, or the platform
/// trust store when none is given.
pub fn upstream_client_config(ca_bundle: Option<&Path>) -> Result<Arc<ClientConfig>, Error> {
	let mut roots = RootCertStore::empty();
	match ca_bundle {
		Some(path) => {
			let certs = CertificateDer::pem_file_iter(path)
				.map_err(|e| Error::CaBundle(format!("{}: {e}", path.display())))?;
			for cert in certs {
				let cert = cert.map_err(|e| Error::CaBundle(format!("{}: {e}", path.display())))?;
				roots
					.add(cert)
					.map_err(|e| Error::CaBundle(format!("{}: {e}", path.display())))?;
			}
		},
		None => {
			let loaded = rustls_native_certs::load_native_certs();
			for err in &loaded.errors {
				warn!("skipping unusable platform trust anchor: {err}");
			}
			for cert in loaded.certs {
				// Individual unusable anchors are common on real systems.
				let _ = roots.add(cert);
			}
		},
	}
	if roots.is_empty() {
		return Err(Error::NoTrustRoots);
	}
	Ok(Arc::new(
		ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth(),
	))
}
