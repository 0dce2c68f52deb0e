//! Identifier and primitive newtypes (C1).
//!
//! Mirrors `imbue.mng.primitives` / `imbue.mngr.primitives` from the prior
//! Python implementation: prefixed random hex ids for agents/hosts, and
//! validated human-readable name newtypes.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::MngrError;

const AGENT_PREFIX: &str = "agent-";
const HOST_PREFIX: &str = "host-";
const HEX_LEN: usize = 32;

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A short random suffix for temp-file names (atomic-write staging).
pub fn random_suffix() -> String {
    random_hex(16)
}

fn validate_prefixed_id(value: &str, prefix: &str, kind: &str) -> Result<(), MngrError> {
    let rest = value.strip_prefix(prefix).ok_or_else(|| {
        MngrError::UserInput(format!("{kind} id {value:?} must start with {prefix:?}"))
    })?;
    if rest.len() != HEX_LEN || !rest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(MngrError::UserInput(format!(
            "{kind} id {value:?} must be {prefix}<{HEX_LEN} hex digits>"
        )));
    }
    Ok(())
}

macro_rules! prefixed_id {
    ($name:ident, $prefix:expr, $kind:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new_random() -> Self {
                Self(format!("{}{}", $prefix, random_hex(HEX_LEN)))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = MngrError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                validate_prefixed_id(s, $prefix, $kind)?;
                Ok(Self(s.to_string()))
            }
        }

        impl TryFrom<String> for $name {
            type Error = MngrError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                validate_prefixed_id(&value, $prefix, $kind)?;
                Ok(Self(value))
            }
        }
    };
}

prefixed_id!(AgentId, AGENT_PREFIX, "agent");
prefixed_id!(HostId, HOST_PREFIX, "host");

fn validate_name(value: &str, kind: &str) -> Result<(), MngrError> {
    if value.is_empty() {
        return Err(MngrError::UserInput(format!("{kind} name must not be empty")));
    }
    if value.len() > 100 {
        return Err(MngrError::UserInput(format!(
            "{kind} name {value:?} is too long (max 100 characters)"
        )));
    }
    if value.contains('/') || value.contains(char::is_whitespace) {
        return Err(MngrError::UserInput(format!(
            "{kind} name {value:?} must not contain '/' or whitespace"
        )));
    }
    Ok(())
}

macro_rules! name_newtype {
    ($name:ident, $kind:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, MngrError> {
                let value = value.into();
                validate_name(&value, $kind)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = MngrError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

name_newtype!(AgentName, "agent");
name_newtype!(HostName, "host");
name_newtype!(ProviderInstanceName, "provider instance");
name_newtype!(ServerName, "server");

/// One of the four backends a provider instance can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderBackendName {
    Local,
    Docker,
    Ssh,
    CloudSandbox,
}

impl fmt::Display for ProviderBackendName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderBackendName::Local => "local",
            ProviderBackendName::Docker => "docker",
            ProviderBackendName::Ssh => "ssh",
            ProviderBackendName::CloudSandbox => "cloud-sandbox",
        })
    }
}

impl FromStr for ProviderBackendName {
    type Err = MngrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(ProviderBackendName::Local),
            "docker" => Ok(ProviderBackendName::Docker),
            "ssh" => Ok(ProviderBackendName::Ssh),
            "cloud-sandbox" => Ok(ProviderBackendName::CloudSandbox),
            other => Err(MngrError::UserInput(format!(
                "unknown provider backend {other:?}"
            ))),
        }
    }
}

/// An opaque one-time authentication code (C8).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OneTimeCode(pub String);

impl OneTimeCode {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            bytes,
        ))
    }
}

impl fmt::Display for OneTimeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates fresh signing-key material: 64 raw random bytes, the spec's
/// floor for the cookie signing key (C8). Distinct from [`OneTimeCode`],
/// which is sized for a short-lived, URL-embedded code, not key material.
pub fn generate_signing_key_material() -> Vec<u8> {
    let mut bytes = vec![0u8; 64];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Secret bytes that must never be logged or serialized verbatim.
#[derive(Clone)]
pub struct CookieSigningKey(pub Vec<u8>);

impl fmt::Debug for CookieSigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CookieSigningKey(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_round_trips() {
        let id = AgentId::new_random();
        let parsed: AgentId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn agent_id_rejects_bad_prefix() {
        assert!("host-0123456789abcdef0123456789abcd".parse::<AgentId>().is_err());
    }

    #[test]
    fn agent_id_rejects_bad_length() {
        assert!("agent-abc".parse::<AgentId>().is_err());
    }

    #[test]
    fn name_rejects_slash() {
        assert!(AgentName::new("a/b").is_err());
    }

    #[test]
    fn signing_key_material_is_at_least_64_bytes() {
        let key = generate_signing_key_material();
        assert_eq!(key.len(), 64);
        let other = generate_signing_key_material();
        assert_ne!(key, other);
    }

    #[test]
    fn backend_name_round_trips() {
        for name in [
            ProviderBackendName::Local,
            ProviderBackendName::Docker,
            ProviderBackendName::Ssh,
            ProviderBackendName::CloudSandbox,
        ] {
            let parsed: ProviderBackendName = name.to_string().parse().unwrap();
            assert_eq!(parsed.to_string(), name.to_string());
        }
    }
}
