//! Serde helpers for config fields that have no native serde representation.

pub mod serde_dur {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer, de};

	pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&durationfmt::to_string(*d))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(deserializer)?;
		let nanos = go_parse_duration::parse_duration(&raw)
			.map_err(|_| de::Error::custom(format!("invalid duration {raw:?}")))?;
		u64::try_from(nanos)
			.map(Duration::from_nanos)
			.map_err(|_| de::Error::custom(format!("negative duration {raw:?}")))
	}
}

pub mod serde_dur_option {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(
		d: &Option<Duration>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match d {
			Some(d) => super::serde_dur::serialize(d, serializer),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(
		deserializer: D,
	) -> Result<Option<Duration>, D::Error> {
		#[derive(Deserialize)]
		struct Wrapper(#[serde(with = "super::serde_dur")] Duration);
		Option::<Wrapper>::deserialize(deserializer).map(|w| w.map(|w| w.0))
	}
}
