//! On-disk persistence for the provisioned VPN profile.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, NetResult};

use super::profile::VpnProfile;

/// The stored profile together with the identity that provisioned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedProfile {
    pub profile: VpnProfile,
    pub owner_uid: u32,
    pub provisioned_at: DateTime<Utc>,
}

/// JSON-file store holding at most one provisioned profile.
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored profile. An absent file means no profile.
    pub fn load(&self) -> NetResult<Option<ProvisionedProfile>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let data = std::fs::read_to_string(&self.path).map_err(|error| {
            Error::Internal(format!(
                "failed to read profile store {}: {error}",
                self.path.display()
            ))
        })?;
        let record: ProvisionedProfile = serde_json::from_str(&data).map_err(|error| {
            Error::Internal(format!(
                "failed to parse profile store {}: {error}",
                self.path.display()
            ))
        })?;

        Ok(Some(record))
    }

    /// Persist the profile, replacing any previous one.
    pub fn save(&self, record: &ProvisionedProfile) -> NetResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                Error::Internal(format!(
                    "failed to create profile directory {}: {error}",
                    parent.display()
                ))
            })?;
        }

        let data = serde_json::to_string_pretty(record).map_err(|error| {
            Error::Internal(format!(
                "failed to serialize profile store {}: {error}",
                self.path.display()
            ))
        })?;
        std::fs::write(&self.path, data).map_err(|error| {
            Error::Internal(format!(
                "failed to write profile store {}: {error}",
                self.path.display()
            ))
        })?;
        Ok(())
    }

    /// Remove the stored profile. Removing an absent profile is a no-op.
    pub fn delete(&self) -> NetResult<()> {
        if !self.path.exists() {
            return Ok(());
        }
        std::fs::remove_file(&self.path).map_err(|error| {
            Error::Internal(format!(
                "failed to remove profile store {}: {error}",
                self.path.display()
            ))
        })
    }
}
