//! Shared fixtures: a throwaway upstream CA, origin servers, and socket
//! helpers for driving the proxy end to end over loopback.

#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;

use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
	KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use snare::{Config, Policy, Proxy};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A freshly generated CA playing the role of the public web PKI: it signs
/// origin certificates, and the proxy is configured to trust it via
/// `caBundle`.
pub struct TestCa {
	key: KeyPair,
	params: CertificateParams,
	pub cert_pem: String,
	pub cert_der: CertificateDer<'static>,
}

impl TestCa {
	pub fn new() -> Self {
		let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
		let mut params = CertificateParams::default();
		params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
		params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, "Upstream Test CA");
		params.distinguished_name = dn;
		let cert = params.clone().self_signed(&key).unwrap();
		Self {
			key,
			params,
			cert_pem: cert.pem(),
			cert_der: cert.der().clone(),
		}
	}

	/// Issue a server certificate covering the given DNS names. Returns the
	/// chain (leaf first) and the leaf key, ready for a rustls server.
	pub fn issue(&self, sans: &[&str]) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
		let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
		let mut params = CertificateParams::default();
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, sans[0]);
		params.distinguished_name = dn;
		params.subject_alt_names = sans
			.iter()
			.map(|san| SanType::DnsName(san.to_string().try_into().unwrap()))
			.collect();
		let issuer = Issuer::from_params(&self.params, &self.key);
		let cert = params.signed_by(&key, &issuer).unwrap();
		let key_der = PrivateKeyDer::try_from(key.serialize_der()).unwrap();
		(vec![cert.der().clone(), self.cert_der.clone()], key_der)
	}

	/// Write the CA certificate to a temp file usable as the proxy's
	/// `caBundle`.
	pub fn bundle_file(&self) -> tempfile::NamedTempFile {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(self.cert_pem.as_bytes()).unwrap();
		file.flush().unwrap();
		file
	}
}

/// Route proxy logs through the test harness when RUST_LOG asks for them.
pub fn init_tracing() {
	use std::sync::Once;
	static INIT: Once = Once::new();
	INIT.call_once(|| {
		let _ = tracing_subscriber::fmt()
			.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
			.with_test_writer()
			.try_init();
	});
}

/// Bind a proxy on ephemeral loopback ports. The returned temp file backs the
/// configured trust bundle and must outlive the proxy.
pub async fn spawn_proxy(policy: Arc<dyn Policy>) -> (Proxy, TestCa, tempfile::NamedTempFile) {
	init_tracing();
	let ca = TestCa::new();
	let bundle = ca.bundle_file();
	let mut cfg = Config::default();
	cfg.ca_bundle = Some(bundle.path().to_path_buf());
	let proxy = Proxy::bind(cfg, policy).await.unwrap();
	(proxy, ca, bundle)
}

/// Read until the header terminator, returning everything read (which may
/// include opportunistically received body bytes).
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
	let mut data = Vec::new();
	let mut byte = [0u8; 1];
	while !data.ends_with(b"\r\n\r\n") {
		match stream.read(&mut byte).await {
			Ok(0) => break,
			Ok(_) => data.push(byte[0]),
			Err(_) => break,
		}
	}
	data
}

/// Read until `needle` has been seen, or the peer closes.
pub async fn read_until_contains<S: AsyncRead + Unpin>(stream: &mut S, needle: &[u8]) -> Vec<u8> {
	let mut data = Vec::new();
	let mut chunk = [0u8; 4096];
	loop {
		if data.windows(needle.len().max(1)).any(|w| w == needle) {
			return data;
		}
		match stream.read(&mut chunk).await {
			Ok(0) => return data,
			Ok(n) => data.extend_from_slice(&chunk[..n]),
			Err(_) => return data,
		}
	}
}

pub async fn write_all<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) {
	stream.write_all(data).await.unwrap();
	stream.flush().await.unwrap();
}
