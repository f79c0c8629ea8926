use serde::{Deserialize, Serialize};

use crate::error::{CompareError, Result};

/// Connection details for one hosted model deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelProfile {
    pub id: String,
    /// Human-readable label shown in output panels.
    #[serde(default)]
    pub name: String,
    pub endpoint: String,
    pub api_key: String,
    pub deployment_id: String,
    #[serde(default)]
    pub api_version: Option<String>,
    /// Forces relay routing for the Phi family when the deployment name
    /// alone would not reveal it.
    #[serde(default)]
    pub is_phi_model: bool,
    #[serde(default)]
    pub is_deepseek_model: bool,
    /// Marks the profile as part of the default comparison set.
    #[serde(default)]
    pub selected: bool,
}

impl ModelProfile {
    /// Display label, falling back to the deployment id when no name is set.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.deployment_id
        } else {
            &self.name
        }
    }

    /// A profile may only be dispatched once endpoint, credential, and
    /// deployment id are all present.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(CompareError::Configuration(format!(
                "model `{}` has no endpoint",
                self.id
            )));
        }
        if self.api_key.trim().is_empty() {
            return Err(CompareError::Configuration(format!(
                "model `{}` has no API key",
                self.id
            )));
        }
        if self.deployment_id.trim().is_empty() {
            return Err(CompareError::Configuration(format!(
                "model `{}` has no deployment id",
                self.id
            )));
        }
        Ok(())
    }
}

/// In-memory registry of model profiles for the lifetime of one session.
///
/// Comparison rounds operate on cloned profiles, so later edits to the
/// registry never affect pipelines already in flight.
#[derive(Debug, Default, Clone)]
pub struct ProfileRegistry {
    profiles: Vec<ModelProfile>,
}

impl ProfileRegistry {
    pub fn new(profiles: Vec<ModelProfile>) -> Self {
        Self { profiles }
    }

    /// Profiles marked as part of the default comparison set.
    pub fn selected(&self) -> Vec<ModelProfile> {
        self.profiles
            .iter()
            .filter(|profile| profile.selected)
            .cloned()
            .collect()
    }

    /// Resolve an explicit id list, rejecting ids the registry does not hold.
    pub fn select_by_ids(&self, ids: &[String]) -> Result<Vec<ModelProfile>> {
        let mut selection = Vec::with_capacity(ids.len());
        for id in ids {
            let profile = self
                .profiles
                .iter()
                .find(|profile| &profile.id == id)
                .ok_or_else(|| {
                    CompareError::Configuration(format!("unknown model id `{id}`"))
                })?;
            selection.push(profile.clone());
        }
        Ok(selection)
    }
}
