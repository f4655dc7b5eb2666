//! Out-of-band credentials for protocol calls.
//!
//! Secrets are stored in a YAML file keyed by protocol operation:
//!
//! ```yaml
//! CreateVolumeSecret:
//!   secretKey: secretval1
//! NodeStageVolumeSecret:
//!   secretKey: secretval5
//! ```
//!
//! Unknown top-level keys are ignored. A known key whose value is not a
//! string-to-string mapping is a parse error.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};

/// Call-scoped authentication metadata for one operation.
pub type SecretMap = HashMap<String, String>;

/// Error type for loading YAML inputs (secrets and test parameters).
#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("failed to read file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("error unmarshaling yaml from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Protocol operations that accept secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretOperation {
    CreateVolume,
    DeleteVolume,
    ControllerPublishVolume,
    ControllerUnpublishVolume,
    NodeStageVolume,
    NodePublishVolume,
    CreateSnapshot,
    DeleteSnapshot,
}

impl SecretOperation {
    pub const ALL: [SecretOperation; 8] = [
        SecretOperation::CreateVolume,
        SecretOperation::DeleteVolume,
        SecretOperation::ControllerPublishVolume,
        SecretOperation::ControllerUnpublishVolume,
        SecretOperation::NodeStageVolume,
        SecretOperation::NodePublishVolume,
        SecretOperation::CreateSnapshot,
        SecretOperation::DeleteSnapshot,
    ];

    /// Top-level key used in the secrets file.
    pub const fn key(self) -> &'static str {
        match self {
            SecretOperation::CreateVolume => "CreateVolumeSecret",
            SecretOperation::DeleteVolume => "DeleteVolumeSecret",
            SecretOperation::ControllerPublishVolume => "ControllerPublishVolumeSecret",
            SecretOperation::ControllerUnpublishVolume => "ControllerUnpublishVolumeSecret",
            SecretOperation::NodeStageVolume => "NodeStageVolumeSecret",
            SecretOperation::NodePublishVolume => "NodePublishVolumeSecret",
            SecretOperation::CreateSnapshot => "CreateSnapshotSecret",
            SecretOperation::DeleteSnapshot => "DeleteSnapshotSecret",
        }
    }
}

impl Display for SecretOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Secrets for every operation. The default value means "no credentials".
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CredentialBundle {
    #[serde(rename = "CreateVolumeSecret", default, deserialize_with = "nullable_map")]
    pub create_volume: SecretMap,
    #[serde(rename = "DeleteVolumeSecret", default, deserialize_with = "nullable_map")]
    pub delete_volume: SecretMap,
    #[serde(
        rename = "ControllerPublishVolumeSecret",
        default,
        deserialize_with = "nullable_map"
    )]
    pub controller_publish_volume: SecretMap,
    #[serde(
        rename = "ControllerUnpublishVolumeSecret",
        default,
        deserialize_with = "nullable_map"
    )]
    pub controller_unpublish_volume: SecretMap,
    #[serde(rename = "NodeStageVolumeSecret", default, deserialize_with = "nullable_map")]
    pub node_stage_volume: SecretMap,
    #[serde(rename = "NodePublishVolumeSecret", default, deserialize_with = "nullable_map")]
    pub node_publish_volume: SecretMap,
    #[serde(rename = "CreateSnapshotSecret", default, deserialize_with = "nullable_map")]
    pub create_snapshot: SecretMap,
    #[serde(rename = "DeleteSnapshotSecret", default, deserialize_with = "nullable_map")]
    pub delete_snapshot: SecretMap,
}

/// `Key:` with no value in YAML is null; treat it as an empty mapping.
fn nullable_map<'de, D>(deserializer: D) -> Result<SecretMap, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<SecretMap>::deserialize(deserializer)?.unwrap_or_default())
}

impl CredentialBundle {
    /// Secrets to attach to a call of `op`.
    pub fn get(&self, op: SecretOperation) -> &SecretMap {
        match op {
            SecretOperation::CreateVolume => &self.create_volume,
            SecretOperation::DeleteVolume => &self.delete_volume,
            SecretOperation::ControllerPublishVolume => &self.controller_publish_volume,
            SecretOperation::ControllerUnpublishVolume => &self.controller_unpublish_volume,
            SecretOperation::NodeStageVolume => &self.node_stage_volume,
            SecretOperation::NodePublishVolume => &self.node_publish_volume,
            SecretOperation::CreateSnapshot => &self.create_snapshot,
            SecretOperation::DeleteSnapshot => &self.delete_snapshot,
        }
    }

    pub fn is_empty(&self) -> bool {
        SecretOperation::ALL.iter().all(|op| self.get(*op).is_empty())
    }
}

/// Parse a YAML document, treating an empty document as the default value.
pub(crate) fn parse_yaml<T>(path: &Path, content: &str) -> Result<T, SecretsError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    serde_yaml::from_str(content).map_err(|source| SecretsError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Read a YAML file into `T`.
pub(crate) async fn read_yaml<T>(path: &Path) -> Result<T, SecretsError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SecretsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    parse_yaml(path, &content)
}

/// Load the credential bundle stored at `path`.
///
/// Callers without a secrets file use `CredentialBundle::default()` instead.
pub async fn load_secrets(path: impl AsRef<Path>) -> Result<CredentialBundle, SecretsError> {
    let path = path.as_ref();
    let bundle: CredentialBundle = read_yaml(path).await?;
    tracing::debug!(path = %path.display(), "loaded secrets");
    Ok(bundle)
}
