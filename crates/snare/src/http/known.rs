//! Header names the proxy inspects or rewrites.

pub const HOST: &str = "Host";
pub const CONNECTION: &str = "Connection";
pub const UPGRADE: &str = "Upgrade";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_ENCODING: &str = "Content-Encoding";
pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub const ACCEPT_ENCODING: &str = "Accept-Encoding";
pub const DATE: &str = "Date";
pub const EXPIRES: &str = "Expires";

// SDCH dictionary negotiation.
pub const X_SDCH: &str = "X-SDCH";
pub const AVAIL_DICTIONARY: &str = "Avail-Dictionary";
pub const GET_DICTIONARY: &str = "Get-Dictionary";

// Alternative protocol advertisement (QUIC and friends).
pub const ALTERNATE_PROTOCOL: &str = "Alternate-Protocol";
pub const ALT_SVC: &str = "Alt-Svc";

// Public key pinning.
pub const PUBLIC_KEY_PINS: &str = "Public-Key-Pins";
pub const PUBLIC_KEY_PINS_REPORT_ONLY: &str = "Public-Key-Pins-Report-Only";
