use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{UpdateError, UpdateResult};
use crate::manifest::UpdateManifest;

const MANIFEST_FILE: &str = "updates.json";
const AUDIT_LOG_FILE: &str = "updates.auditlog";
const INSTANCE_ID_FILE: &str = "instance-id";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub timestamp: String,
    pub update_level: u64,
    pub manifest: UpdateManifest,
}

#[derive(Debug, Clone)]
pub struct PersistentState {
    data_dir: PathBuf,
}

impl PersistentState {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir.join(MANIFEST_FILE)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir.join(AUDIT_LOG_FILE)
    }

    pub fn save(&self, manifest: &UpdateManifest) -> UpdateResult<()> {
        let path = self.manifest_path();
        ensure_parent(&path)?;

        let payload = serde_json::to_string_pretty(manifest).map_err(|err| {
            UpdateError::local_io(
                "failed encoding update manifest",
                std::io::Error::new(ErrorKind::InvalidData, err),
            )
        })?;
        let tmp = atomic_tmp_path(&path);
        fs::write(&tmp, payload).map_err(|err| UpdateError::io_at("writing", &tmp, err))?;
        fs::rename(&tmp, &path).map_err(|err| UpdateError::io_at("replacing", &path, err))?;

        self.append_audit_record(manifest)
    }

    pub fn load(&self) -> UpdateResult<Option<UpdateManifest>> {
        let path = self.manifest_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(UpdateError::io_at("reading", &path, err)),
        };
        let manifest = serde_json::from_str(&raw).map_err(|err| {
            UpdateError::ManifestFormat(format!(
                "failed decoding persisted manifest {}: {}",
                path.display(),
                err
            ))
        })?;
        Ok(Some(manifest))
    }

    pub fn current_level(&self) -> UpdateResult<u64> {
        Ok(self.load()?.map(|manifest| manifest.level()).unwrap_or(0))
    }

    pub fn audit_records(&self) -> UpdateResult<Vec<AuditRecord>> {
        let path = self.audit_log_path();
        let file = match OpenOptions::new().read(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(UpdateError::io_at("opening", &path, err)),
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|err| UpdateError::io_at("reading", &path, err))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line).map_err(|err| {
                UpdateError::ManifestFormat(format!(
                    "failed decoding audit entry in {}: {}",
                    path.display(),
                    err
                ))
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Returns the configured id, or the one persisted on a previous run,
    /// generating and storing a fresh UUID the first time.
    pub fn load_or_create_instance_id(&self, configured: Option<&str>) -> UpdateResult<String> {
        if let Some(id) = configured.map(str::trim).filter(|id| !id.is_empty()) {
            return Ok(id.to_string());
        }

        let path = self.data_dir.join(INSTANCE_ID_FILE);
        match fs::read_to_string(&path) {
            Ok(raw) if !raw.trim().is_empty() => return Ok(raw.trim().to_string()),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(UpdateError::io_at("reading", &path, err)),
        }

        ensure_parent(&path)?;
        let id = uuid::Uuid::new_v4().to_string();
        fs::write(&path, &id).map_err(|err| UpdateError::io_at("writing", &path, err))?;
        tracing::info!(instance_id = %id, path = %path.display(), "generated instance id");
        Ok(id)
    }

    fn append_audit_record(&self, manifest: &UpdateManifest) -> UpdateResult<()> {
        let record = AuditRecord {
            timestamp: Utc::now().to_rfc3339(),
            update_level: manifest.level(),
            manifest: manifest.clone(),
        };
        let line = serde_json::to_string(&record).map_err(|err| {
            UpdateError::local_io(
                "failed encoding audit record",
                std::io::Error::new(ErrorKind::InvalidData, err),
            )
        })?;

        let path = self.audit_log_path();
        ensure_parent(&path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| UpdateError::io_at("opening", &path, err))?;
        writeln!(file, "{}", line).map_err(|err| UpdateError::io_at("appending", &path, err))?;
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> UpdateResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| UpdateError::io_at("creating", parent, err))?;
    }
    Ok(())
}

pub(crate) fn atomic_tmp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("tmp");
    path.with_file_name(format!("{file_name}.tmp"))
}
