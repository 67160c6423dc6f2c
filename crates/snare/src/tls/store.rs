//! In-memory certificate store: one self-signed root CA generated per
//! process, plus lazily forged leaf certificates (and their rustls server
//! configs) mirroring the subject and SANs of verified upstream certificates.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use itertools::Itertools;
use parking_lot::Mutex;
use rand::Rng;
use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
	KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, warn};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use super::Error;

const VALIDITY_DAYS: u64 = 365;

pub struct Store {
	ca_key: KeyPair,
	ca_params: CertificateParams,
	ca_der: CertificateDer<'static>,
	ca_pem: String,
	/// lowercase hostname -> shared server config. Every DNS name covered by
	/// a forged leaf points at the same config.
	configs: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl std::fmt::Debug for Store {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Store")
			.field("cached", &self.configs.lock().len())
			.finish()
	}
}

impl Store {
	/// Generate the root CA and an empty cache. The CA private key lives only
	/// in memory for the lifetime of the store.
	pub fn new(country: &str, organization: &str, common_name: &str) -> Result<Self, Error> {
		let ca_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;

		let mut params = CertificateParams::default();
		params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
		params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CountryName, country);
		dn.push(DnType::OrganizationName, organization);
		dn.push(DnType::CommonName, common_name);
		params.distinguished_name = dn;
		params.not_before = SystemTime::now().into();
		params.not_after = validity_end().into();
		params.serial_number = Some(random_serial());

		let cert = params.clone().self_signed(&ca_key)?;
		let ca_pem = cert.pem();
		let ca_der = cert.der().clone();

		Ok(Self {
			ca_key,
			ca_params: params,
			ca_der,
			ca_pem,
			configs: Mutex::new(HashMap::new()),
		})
	}

	/// Root certificate as PEM, for out-of-band trust installation.
	pub fn root_pem(&self) -> &str {
		&self.ca_pem
	}

	pub fn root_der(&self) -> CertificateDer<'static> {
		self.ca_der.clone()
	}

	pub fn write_root_to_file(&self, path: &Path) -> std::io::Result<()> {
		std::fs::write(path, self.ca_pem.as_bytes())
	}

	/// Return a server config able to impersonate `hostname`, forging one
	/// from `upstream_leaf` on first sight. The forged leaf copies the
	/// upstream subject and every DNS SAN, and the resulting config is cached
	/// under all of those names.
	pub fn server_config(
		&self,
		hostname: &str,
		upstream_leaf: &CertificateDer<'_>,
	) -> Result<Arc<ServerConfig>, Error> {
		let host = hostname.to_ascii_lowercase();
		let mut cache = self.configs.lock();
		if let Some(config) = cache.get(&host) {
			return Ok(config.clone());
		}
		self.spoof(&mut cache, &host, upstream_leaf)
	}

	fn spoof(
		&self,
		cache: &mut HashMap<String, Arc<ServerConfig>>,
		host: &str,
		upstream_leaf: &CertificateDer<'_>,
	) -> Result<Arc<ServerConfig>, Error> {
		let (_, parsed) = X509Certificate::from_der(upstream_leaf.as_ref())
			.map_err(|e| Error::BadUpstreamLeaf(e.to_string()))?;

		let subject = parsed.subject();
		let mut dn = DistinguishedName::new();
		// A subject field that fails to copy is skipped rather than fatal;
		// clients accept sparse subjects as long as a SAN matches.
		let mut copy_field = |ty: DnType, value: Option<&str>| {
			if let Some(value) = value {
				dn.push(ty, value);
			}
		};
		copy_field(
			DnType::CountryName,
			subject.iter_country().next().and_then(|a| a.as_str().ok()),
		);
		copy_field(
			DnType::OrganizationName,
			subject
				.iter_organization()
				.next()
				.and_then(|a| a.as_str().ok()),
		);
		copy_field(
			DnType::CommonName,
			subject
				.iter_common_name()
				.next()
				.and_then(|a| a.as_str().ok()),
		);

		let san_names: Vec<String> = match parsed.subject_alternative_name() {
			Ok(Some(ext)) => ext
				.value
				.general_names
				.iter()
				.filter_map(|name| match name {
					GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
					_ => None,
				})
				.unique()
				.collect(),
			_ => Vec::new(),
		};

		let mut params = CertificateParams::default();
		params.distinguished_name = dn;
		params.not_before = SystemTime::now().into();
		params.not_after = validity_end().into();
		params.serial_number = Some(random_serial());
		params.subject_alt_names = san_names
			.iter()
			.filter_map(|name| match name.clone().try_into() {
				Ok(ia5) => Some(SanType::DnsName(ia5)),
				Err(_) => {
					warn!(name, "skipping malformed dns san on upstream certificate");
					None
				},
			})
			.collect();

		let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
		let issuer = Issuer::from_params(&self.ca_params, &self.ca_key);
		let cert = params.signed_by(&leaf_key, &issuer)?;

		let key_der = PrivateKeyDer::try_from(leaf_key.serialize_der())
			.map_err(|e| Error::BadKey(e.to_string()))?;
		let chain = vec![cert.der().clone(), self.ca_der.clone()];
		let mut config = ServerConfig::builder()
			.with_no_client_auth()
			.with_single_cert(chain, key_der)?;
		// HTTP/1.1 only; offering h2 would hand the parser a protocol it does
		// not speak.
		config.alpn_protocols = vec![b"http/1.1".to_vec()];
		let config = Arc::new(config);

		let mut inserted = false;
		for name in san_names.iter().map(String::as_str).chain([host]) {
			if !cache.contains_key(name) {
				cache.insert(name.to_string(), config.clone());
				inserted = true;
			}
		}
		if !inserted {
			// Every name already points at a context: either caller error, or
			// an upstream certificate lying about the names it covers.
			return Err(Error::AmbiguousSpoof);
		}
		debug!(host, sans = san_names.len(), "forged server certificate");
		Ok(config)
	}

	#[cfg(test)]
	fn cached_names(&self) -> usize {
		self.configs.lock().len()
	}
}

fn validity_end() -> SystemTime {
	SystemTime::now() + Duration::from_secs(VALIDITY_DAYS * 24 * 60 * 60)
}

/// Random 31-bit serial.
fn random_serial() -> SerialNumber {
	let mut bytes = [0u8; 4];
	rand::rng().fill_bytes(&mut bytes);
	bytes[0] &= 0x7f;
	SerialNumber::from_slice(&bytes)
}
