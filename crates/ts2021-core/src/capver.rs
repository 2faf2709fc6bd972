//! Client capability versions.
//!
//! Every client declares an integer capability version on each request. The
//! server compares it against a deployment-wide floor and refuses anything
//! older. The table below maps capability versions to the client release
//! that introduced them, for diagnostics only.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability version declared by a client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityVersion(pub i32);

impl fmt::Display for CapabilityVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for CapabilityVersion {
    fn from(v: u16) -> Self {
        Self(i32::from(v))
    }
}

impl From<i32> for CapabilityVersion {
    fn from(v: i32) -> Self {
        Self(v)
    }
}

/// Oldest capability version the server still talks to.
pub const MIN_SUPPORTED_CAPABILITY_VERSION: CapabilityVersion = CapabilityVersion(88);

/// Capability version that introduced the early payload sent before HTTP/2.
pub const EARLY_NOISE_CAPABILITY_VERSION: CapabilityVersion = CapabilityVersion(49);

/// Capability version -> first client release carrying it, ascending.
const RELEASES: &[(i32, &str)] = &[
    (49, "v1.34"),
    (56, "v1.48"),
    (58, "v1.50"),
    (61, "v1.52"),
    (68, "v1.54"),
    (74, "v1.56"),
    (82, "v1.58"),
    (87, "v1.60"),
    (88, "v1.62"),
    (90, "v1.64"),
    (95, "v1.66"),
    (97, "v1.68"),
    (102, "v1.70"),
    (104, "v1.72"),
    (106, "v1.74"),
    (109, "v1.78"),
    (113, "v1.80"),
    (115, "v1.82"),
    (116, "v1.84"),
];

/// Release name for an exact capability version, if known.
pub fn tailscale_version(version: CapabilityVersion) -> Option<&'static str> {
    RELEASES
        .binary_search_by_key(&version.0, |(v, _)| *v)
        .ok()
        .map(|idx| RELEASES[idx].1)
}

/// Release name for logs and error messages; `"unknown"` when not in the table.
pub fn display_version(version: CapabilityVersion) -> &'static str {
    tailscale_version(version).unwrap_or("unknown")
}

/// Whether a client declaring `version` may use the control channel.
pub fn is_supported_version(version: CapabilityVersion) -> bool {
    version >= MIN_SUPPORTED_CAPABILITY_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControlError;

    #[test]
    fn table_is_sorted() {
        assert!(RELEASES.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn known_and_unknown_versions() {
        assert_eq!(tailscale_version(CapabilityVersion(88)), Some("v1.62"));
        assert_eq!(tailscale_version(CapabilityVersion(89)), None);
        assert_eq!(display_version(CapabilityVersion(3)), "unknown");
    }

    #[test]
    fn floor_is_inclusive() {
        assert!(is_supported_version(MIN_SUPPORTED_CAPABILITY_VERSION));
        assert!(!is_supported_version(CapabilityVersion(
            MIN_SUPPORTED_CAPABILITY_VERSION.0 - 1
        )));
        assert!(EARLY_NOISE_CAPABILITY_VERSION < MIN_SUPPORTED_CAPABILITY_VERSION);
    }

    #[test]
    fn unsupported_error_message() {
        let err = ControlError::UnsupportedClientVersion(CapabilityVersion(56));
        assert_eq!(err.to_string(), "unsupported client version: v1.48 (56)");

        let err = ControlError::UnsupportedClientVersion(CapabilityVersion(12));
        assert_eq!(err.to_string(), "unsupported client version: unknown (12)");
    }

    #[test]
    fn serde_is_plain_integer() {
        let v: CapabilityVersion = serde_json::from_str("106").unwrap();
        assert_eq!(v, CapabilityVersion(106));
        assert_eq!(serde_json::to_string(&v).unwrap(), "106");
    }
}
