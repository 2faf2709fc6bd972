//! ts2021-core: shared protocol library for the TS2021 control channel.
//!
//! Provides client capability versions, Curve25519 key types, the JSON
//! message model, the early payload codec and the Noise IK secure channel.

pub mod capver;
pub mod controlbase;
pub mod early;
pub mod error;
pub mod key;
pub mod tailcfg;

// Re-export commonly used items at crate root.
pub use capver::{
    is_supported_version, CapabilityVersion, EARLY_NOISE_CAPABILITY_VERSION,
    MIN_SUPPORTED_CAPABILITY_VERSION,
};
pub use controlbase::{ClientHandshake, Conn, ConnPumps, ServerHandshake};
pub use early::{write_early_payload, EarlyPayloadDecoder, EARLY_PAYLOAD_MAGIC};
pub use error::{ControlError, ControlResult};
pub use key::{ChallengePrivate, ChallengePublic, MachinePrivate, MachinePublic, NodePublic};
