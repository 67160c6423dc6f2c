use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub mod http;
pub mod proxy;
pub mod serdes;
pub mod tls;
pub mod transport;

pub use proxy::Proxy;
pub use proxy::policy::{AllowAll, Decision, Policy, Verdict};

/// RawConfig represents the inputs a user can pass in. Config represents the
/// internal representation of this.
#[derive(serde::Deserialize, Default, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	/// Plain HTTP listener address in the format "ip:port". Port 0 selects an
	/// ephemeral port; the chosen port is queryable once bound.
	http_addr: Option<String>,
	/// TLS listener address in the format "ip:port".
	tls_addr: Option<String>,

	ca: Option<RawCaConfig>,

	/// Path to a PEM bundle used to verify upstream certificates. When unset,
	/// the platform trust store is used.
	ca_bundle: Option<PathBuf>,

	/// Port connected on the upstream side for intercepted TLS flows. The SNI
	/// extension carries no port information, so flows diverted from
	/// non-standard ports need this override.
	tls_upstream_port: Option<u16>,

	#[serde(default, with = "serdes::serde_dur_option")]
	stream_timeout: Option<Duration>,

	/// Specify the number of worker threads the embedding Tokio runtime should
	/// use. The library itself runs on whatever runtime drives it.
	worker_threads: Option<usize>,
}

#[derive(serde::Deserialize, Default, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawCaConfig {
	country: Option<String>,
	organization: Option<String>,
	common_name: Option<String>,
}

#[derive(serde::Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
	pub http_addr: SocketAddr,
	pub tls_addr: SocketAddr,
	pub ca: CaConfig,
	pub ca_bundle: Option<PathBuf>,
	pub tls_upstream_port: u16,
	#[serde(with = "serdes::serde_dur")]
	pub stream_timeout: Duration,
	pub num_worker_threads: usize,
}

/// Subject fields stamped onto the generated root CA.
#[derive(serde::Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CaConfig {
	pub country: String,
	pub organization: String,
	pub common_name: String,
}

impl Default for CaConfig {
	fn default() -> Self {
		Self {
			country: "US".to_string(),
			organization: "Snare".to_string(),
			common_name: "Snare Root CA".to_string(),
		}
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			http_addr: "127.0.0.1:0".parse().expect("static address"),
			tls_addr: "127.0.0.1:0".parse().expect("static address"),
			ca: CaConfig::default(),
			ca_bundle: None,
			tls_upstream_port: 443,
			stream_timeout: Duration::from_secs(5 * 60),
			num_worker_threads: num_cpus::get(),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("invalid yaml: {0}")]
	Parse(#[from] serde_yaml::Error),
	#[error("invalid listener address {addr}: {source}")]
	Address {
		addr: String,
		source: std::net::AddrParseError,
	},
}

impl Config {
	pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
		let raw: RawConfig = serde_yaml::from_str(contents)?;
		Self::from_raw(raw)
	}

	pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
		let defaults = Config::default();
		let parse_addr = |s: Option<String>, dflt: SocketAddr| match s {
			Some(s) => s
				.parse()
				.map_err(|source| ConfigError::Address { addr: s, source }),
			None => Ok(dflt),
		};
		let ca = raw.ca.unwrap_or_default();
		let ca_defaults = CaConfig::default();
		Ok(Config {
			http_addr: parse_addr(raw.http_addr, defaults.http_addr)?,
			tls_addr: parse_addr(raw.tls_addr, defaults.tls_addr)?,
			ca: CaConfig {
				country: ca.country.unwrap_or(ca_defaults.country),
				organization: ca.organization.unwrap_or(ca_defaults.organization),
				common_name: ca.common_name.unwrap_or(ca_defaults.common_name),
			},
			ca_bundle: raw.ca_bundle,
			tls_upstream_port: raw.tls_upstream_port.unwrap_or(defaults.tls_upstream_port),
			stream_timeout: raw.stream_timeout.unwrap_or(defaults.stream_timeout),
			num_worker_threads: raw.worker_threads.unwrap_or(defaults.num_worker_threads),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn config_from_yaml() {
		let cfg = Config::from_yaml(
			r#"
httpAddr: "127.0.0.1:9080"
tlsAddr: "127.0.0.1:9443"
ca:
  organization: "Test Org"
streamTimeout: 30s
"#,
		)
		.unwrap();
		assert_eq!(cfg.http_addr.port(), 9080);
		assert_eq!(cfg.tls_addr.port(), 9443);
		assert_eq!(cfg.ca.organization, "Test Org");
		assert_eq!(cfg.ca.country, "US");
		assert_eq!(cfg.stream_timeout, Duration::from_secs(30));
		assert_eq!(cfg.tls_upstream_port, 443);
	}

	#[test]
	fn config_rejects_unknown_fields() {
		assert!(Config::from_yaml("listenPort: 8080\n").is_err());
	}

	#[test]
	fn config_rejects_bad_address() {
		let err = Config::from_yaml("httpAddr: \"not an addr\"\n").unwrap_err();
		assert!(matches!(err, ConfigError::Address { .. }));
	}
}
