//! Curve25519 keys used on the control channel.
//!
//! Three public key families share one representation: the machine key
//! (Noise static key of a connection), the node key (identity of a network
//! participant) and the per-connection challenge key. Their text form is
//! `<prefix>:<64 hex chars>`; logs use [`NodePublic::short_string`] style
//! identifiers.

use crate::error::{ControlError, ControlResult};
use data_encoding::BASE64;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::info;
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of every raw key in bytes.
pub const KEY_LEN: usize = 32;

fn parse_prefixed(s: &str, prefix: &str) -> ControlResult<[u8; KEY_LEN]> {
    let hex_part = s
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or_else(|| ControlError::InvalidKey(format!("missing {prefix}: prefix")))?;
    let bytes = hex::decode(hex_part)
        .map_err(|e| ControlError::InvalidKey(format!("{prefix}: {e}")))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| ControlError::InvalidKey(format!("{prefix}: expected 32 bytes, got {}", v.len())))
}

fn short(raw: &[u8; KEY_LEN]) -> String {
    let encoded = BASE64.encode(raw);
    format!("[{}]", &encoded[..5])
}

macro_rules! public_key {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; KEY_LEN]);

        impl $name {
            /// Text prefix of this key family.
            pub const PREFIX: &'static str = $prefix;

            pub fn from_raw32(raw: [u8; KEY_LEN]) -> Self {
                Self(raw)
            }

            pub fn raw32(&self) -> [u8; KEY_LEN] {
                self.0
            }

            pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; KEY_LEN]
            }

            /// Short, log-friendly identifier: `[` + first 5 base64 chars + `]`.
            pub fn short_string(&self) -> String {
                short(&self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}:{}", Self::PREFIX, hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", stringify!($name), self.short_string())
            }
        }

        impl FromStr for $name {
            type Err = ControlError;

            fn from_str(s: &str) -> ControlResult<Self> {
                parse_prefixed(s, Self::PREFIX).map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

public_key!(
    /// Public half of a machine's Noise static key.
    MachinePublic,
    "mkey"
);

public_key!(
    /// Public key identifying a node in the network.
    NodePublic,
    "nodekey"
);

public_key!(
    /// Public half of a per-connection challenge key.
    ChallengePublic,
    "chalpub"
);

/// A machine's long-term Noise static private key.
#[derive(Clone)]
pub struct MachinePrivate(StaticSecret);

impl MachinePrivate {
    pub const PREFIX: &'static str = "privkey";

    /// Generate a fresh key from the OS RNG.
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_raw32(raw: [u8; KEY_LEN]) -> Self {
        Self(StaticSecret::from(raw))
    }

    pub fn raw32(&self) -> [u8; KEY_LEN] {
        self.0.to_bytes()
    }

    pub fn public(&self) -> MachinePublic {
        MachinePublic(PublicKey::from(&self.0).to_bytes())
    }

    /// Text form, `privkey:<hex>`.
    pub fn to_text(&self) -> String {
        format!("{}:{}", Self::PREFIX, hex::encode(self.0.to_bytes()))
    }

    /// Read the key stored at `path`, or create it with a fresh key.
    pub fn load_or_generate(path: &Path) -> ControlResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let key = content.trim().parse()?;
            info!(path = %path.display(), "loaded noise private key");
            return Ok(key);
        }

        let key = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_private(path, &key.to_text())?;
        info!(path = %path.display(), "generated noise private key");
        Ok(key)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, text: &str) -> ControlResult<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(text.as_bytes())?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, text: &str) -> ControlResult<()> {
    std::fs::write(path, text)?;
    Ok(())
}

impl FromStr for MachinePrivate {
    type Err = ControlError;

    fn from_str(s: &str) -> ControlResult<Self> {
        parse_prefixed(s, Self::PREFIX).map(Self::from_raw32)
    }
}

impl fmt::Debug for MachinePrivate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachinePrivate(public={})", self.public().short_string())
    }
}

/// Ephemeral per-connection challenge key. Never persisted.
#[derive(Clone)]
pub struct ChallengePrivate(StaticSecret);

impl ChallengePrivate {
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn public(&self) -> ChallengePublic {
        ChallengePublic(PublicKey::from(&self.0).to_bytes())
    }
}

impl fmt::Debug for ChallengePrivate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChallengePrivate(public={})", self.public().short_string())
    }
}
