//! JSON messages exchanged over the control channel.
//!
//! Field names follow the client wire format (PascalCase, a few acronyms).
//! Unknown fields are ignored and missing fields take their default value so
//! that newer and older clients decode alike.

use crate::capver::CapabilityVersion;
use crate::key::{ChallengePublic, MachinePublic, NodePublic};
use serde::{Deserialize, Serialize};

/// Payload of the early frame written before HTTP/2 starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarlyNoise {
    #[serde(rename = "NodeKeyChallenge")]
    pub node_key_challenge: ChallengePublic,
}

/// Pre-auth key material carried by a registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RegisterAuth {
    pub auth_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RegisterRequest {
    pub version: CapabilityVersion,
    pub node_key: NodePublic,
    pub old_node_key: NodePublic,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<RegisterAuth>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub followup: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostinfo: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ephemeral: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct UserProfile {
    #[serde(rename = "ID")]
    pub id: u64,
    pub login_name: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RegisterResponse {
    pub user: UserProfile,
    pub login: UserProfile,
    pub node_key_expired: bool,
    pub machine_authorized: bool,
    #[serde(rename = "AuthURL", skip_serializing_if = "String::is_empty")]
    pub auth_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct MapRequest {
    pub version: CapabilityVersion,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub compress: String,
    pub keep_alive: bool,
    pub node_key: NodePublic,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub disco_key: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostinfo: Option<serde_json::Value>,
    pub stream: bool,
    pub read_only: bool,
    pub omit_peers: bool,
}

/// A network participant as seen by other nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Node {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "StableID")]
    pub stable_id: String,
    pub name: String,
    pub user: u64,
    pub key: NodePublic,
    pub machine: MachinePublic,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub disco_key: String,
    pub addresses: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostinfo: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct MapResponse {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub keep_alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<Node>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<Node>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub domain: String,
}

impl MapResponse {
    pub fn keep_alive() -> Self {
        Self {
            keep_alive: true,
            ..Default::default()
        }
    }
}

/// Body of `GET /key`: the server's Noise public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverTlsPublicKeyResponse {
    pub legacy_public_key: MachinePublic,
    pub public_key: MachinePublic,
}
