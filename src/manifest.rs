use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{UpdateError, UpdateResult};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateManifest {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub meta: UpdateMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core: Option<CoreUpdate>,
    #[serde(default)]
    pub plugins: PluginChanges,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMeta {
    pub level: u64,
    #[serde(default)]
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreUpdate {
    pub url: String,
    #[serde(default)]
    pub checksum: Checksum,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PluginChanges {
    #[serde(default)]
    pub updates: Vec<PluginUpdate>,
    #[serde(default)]
    pub deletes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginUpdate {
    pub artifact_id: String,
    pub url: String,
    #[serde(default)]
    pub checksum: Checksum,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checksum {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub signature: String,
}

impl Checksum {
    pub fn sha256(signature: impl Into<String>) -> Self {
        Self {
            kind: Some("sha256".to_string()),
            signature: signature.into(),
        }
    }

    pub fn expected_sha256(&self) -> Option<&str> {
        let signature = self.signature.trim();
        if signature.is_empty() {
            None
        } else {
            Some(signature)
        }
    }

    fn validate(&self, owner: &str) -> UpdateResult<()> {
        if let Some(kind) = self.kind.as_deref() {
            let kind = kind.trim();
            if !kind.is_empty() && !kind.eq_ignore_ascii_case("sha256") {
                return Err(UpdateError::ManifestFormat(format!(
                    "{owner}: unsupported checksum type '{kind}'"
                )));
            }
        }
        if let Some(signature) = self.expected_sha256() {
            if signature.len() != 64 || !signature.chars().all(|ch| ch.is_ascii_hexdigit()) {
                return Err(UpdateError::ManifestFormat(format!(
                    "{owner}: checksum must be a 64-character SHA-256 hex string"
                )));
            }
        }
        Ok(())
    }
}

fn default_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

impl UpdateManifest {
    pub fn new(level: u64, channel: impl Into<String>) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            meta: UpdateMeta {
                level,
                channel: channel.into(),
            },
            core: None,
            plugins: PluginChanges::default(),
        }
    }

    pub fn from_json(raw: &str) -> UpdateResult<Self> {
        let manifest: Self = serde_json::from_str(raw)
            .map_err(|err| UpdateError::ManifestFormat(err.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn level(&self) -> u64 {
        self.meta.level
    }

    pub fn is_noop(&self) -> bool {
        self.core.is_none() && self.plugins.updates.is_empty() && self.plugins.deletes.is_empty()
    }

    pub fn artifact_count(&self) -> usize {
        self.plugins.updates.len() + usize::from(self.core.is_some())
    }

    pub fn validate(&self) -> UpdateResult<()> {
        if let Some(core) = self.core.as_ref() {
            if core.url.trim().is_empty() {
                return Err(UpdateError::ManifestFormat("core url is empty".to_string()));
            }
            core.checksum.validate("core")?;
        }

        let mut seen = HashSet::new();
        for update in &self.plugins.updates {
            let id = update.artifact_id.as_str();
            validate_artifact_id(id)?;
            if update.url.trim().is_empty() {
                return Err(UpdateError::ManifestFormat(format!(
                    "plugin '{id}' has an empty url"
                )));
            }
            if !seen.insert(id.to_string()) {
                return Err(UpdateError::ManifestFormat(format!(
                    "plugin '{id}' is listed more than once"
                )));
            }
            update.checksum.validate(&format!("plugin '{id}'"))?;
        }

        for name in &self.plugins.deletes {
            validate_artifact_id(name)?;
        }

        Ok(())
    }
}

fn validate_artifact_id(id: &str) -> UpdateResult<()> {
    if id.is_empty() {
        return Err(UpdateError::ManifestFormat(
            "plugin artifact id is empty".to_string(),
        ));
    }
    if id.trim() != id {
        return Err(UpdateError::ManifestFormat(format!(
            "plugin artifact id '{id}' has surrounding whitespace"
        )));
    }
    if id.contains('/') || id.contains('\\') || id == "." || id == ".." {
        return Err(UpdateError::ManifestFormat(format!(
            "plugin artifact id '{id}' must not contain path separators"
        )));
    }
    Ok(())
}
