//! Client capability version gate.

use crate::error::HttpError;
use tracing::warn;
use ts2021_core::capver::{self, CapabilityVersion, MIN_SUPPORTED_CAPABILITY_VERSION};
use ts2021_core::{is_supported_version, ControlError, MachinePublic, NodePublic};

/// Refuse requests from clients older than the supported minimum.
///
/// Supported versions pass with no side effects. Anything else is logged and
/// turned into a 400 carrying the version's release name and number.
pub fn reject_unsupported(
    version: CapabilityVersion,
    machine_key: &MachinePublic,
    node_key: &NodePublic,
) -> Result<(), HttpError> {
    if is_supported_version(version) {
        return Ok(());
    }

    warn!(
        min_version = %capver::display_version(MIN_SUPPORTED_CAPABILITY_VERSION),
        min_cap_ver = %MIN_SUPPORTED_CAPABILITY_VERSION,
        client_version = %capver::display_version(version),
        client_cap_ver = %version,
        machine_key = %machine_key.short_string(),
        node_key = %node_key.short_string(),
        "unsupported client connected"
    );

    Err(HttpError::bad_request(
        ControlError::UnsupportedClientVersion(version).to_string(),
    ))
}
