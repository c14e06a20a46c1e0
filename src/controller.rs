use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::config::Settings;
use crate::directory::{DirectoryApi, HttpDirectory};
use crate::download::{DownloadedArtifact, Downloader, StagedArtifact};
use crate::error::{UpdateError, UpdateResult};
use crate::health::{HealthChecker, HealthGate};
use crate::manifest::UpdateManifest;
use crate::notify::{LogNotifier, Notifier};
use crate::observability;
use crate::snapshot::{transition_message, RevertOutcome, Snapshotter};
use crate::state::PersistentState;
use crate::supervisor::{ProcessSupervisor, XmlRpcProcessControl};

const CORE_FILE_NAME: &str = "jenkins.war";
const PLUGINS_DIR: &str = "plugins";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdatePhase {
    Idle,
    Downloading,
    Snapshotting,
    Restarting,
    HealthChecking,
    RollingBack,
    Tainting,
    RevertQuery,
    RevertApplying,
    FatalUnrecovered,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateSession {
    pub started_at: String,
    pub level: u64,
    pub forced: bool,
}

// Clears the session slot on every exit path, including a dropped future.
struct SessionGuard<'a> {
    controller: &'a UpdateController,
    owned: bool,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        lock_or_recover(&self.controller.session).take();
        let mut phase = lock_or_recover(&self.controller.phase);
        if *phase != UpdatePhase::FatalUnrecovered {
            *phase = UpdatePhase::Idle;
        }
    }
}

enum Prepared {
    Persisted,
    NeedsRestart,
}

pub struct UpdateControllerParts {
    pub directory: Arc<dyn DirectoryApi>,
    pub downloader: Downloader,
    pub health: Arc<dyn HealthGate>,
    pub snapshotter: Snapshotter,
    pub supervisor: ProcessSupervisor,
    pub state: PersistentState,
    pub notifier: Arc<dyn Notifier>,
    pub jenkins_home: PathBuf,
    pub process_name: String,
    pub instance_id: String,
}

pub struct UpdateController {
    directory: Arc<dyn DirectoryApi>,
    downloader: Downloader,
    health: Arc<dyn HealthGate>,
    snapshotter: Snapshotter,
    supervisor: ProcessSupervisor,
    state: PersistentState,
    notifier: Arc<dyn Notifier>,
    jenkins_home: PathBuf,
    process_name: String,
    instance_id: String,
    session: Mutex<Option<UpdateSession>>,
    phase: Mutex<UpdatePhase>,
}

impl UpdateController {
    pub fn new(parts: UpdateControllerParts) -> Self {
        Self {
            directory: parts.directory,
            downloader: parts.downloader,
            health: parts.health,
            snapshotter: parts.snapshotter,
            supervisor: parts.supervisor,
            state: parts.state,
            notifier: parts.notifier,
            jenkins_home: parts.jenkins_home,
            process_name: parts.process_name,
            instance_id: parts.instance_id,
            session: Mutex::new(None),
            phase: Mutex::new(UpdatePhase::Idle),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let timeout = Duration::from_secs(settings.request_timeout_secs.max(1));
        let state = PersistentState::new(&settings.data_dir);
        let instance_id = state
            .load_or_create_instance_id(settings.instance_id.as_deref())
            .context("failed resolving instance id")?;

        let directory = HttpDirectory::new(
            settings.endpoint.clone(),
            settings.directory_token.clone(),
            timeout,
        )
        .context("failed building directory client")?;
        let downloader =
            Downloader::new(timeout, settings.download).context("failed building downloader")?;
        let health = HealthChecker::new(settings.jenkins_url.clone(), timeout)
            .context("failed building health checker")?
            .with_policies(settings.health_identity, settings.health_metrics);
        let control = XmlRpcProcessControl::new(settings.supervisor_url.clone(), timeout)
            .context("failed building supervisor client")?;

        Ok(Self::new(UpdateControllerParts {
            directory: Arc::new(directory),
            downloader,
            health: Arc::new(health),
            snapshotter: Snapshotter::new(&settings.jenkins_home, settings.snapshotting_enabled),
            supervisor: ProcessSupervisor::new(Box::new(control)),
            state,
            notifier: Arc::new(LogNotifier),
            jenkins_home: settings.jenkins_home.clone(),
            process_name: settings.process_name.clone(),
            instance_id,
        }))
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn state(&self) -> &PersistentState {
        &self.state
    }

    pub fn snapshotter(&self) -> &Snapshotter {
        &self.snapshotter
    }

    pub fn health(&self) -> &dyn HealthGate {
        self.health.as_ref()
    }

    pub fn phase(&self) -> UpdatePhase {
        *lock_or_recover(&self.phase)
    }

    pub fn current_session(&self) -> Option<UpdateSession> {
        lock_or_recover(&self.session).clone()
    }

    pub fn prepare(&self) -> UpdateResult<()> {
        self.snapshotter.init()
    }

    pub fn get_current_level(&self) -> UpdateResult<u64> {
        self.state.current_level()
    }

    pub async fn query(&self) -> UpdateResult<Option<UpdateManifest>> {
        let level = self.get_current_level()?;
        self.directory.query(&self.instance_id, level).await
    }

    #[instrument(
        name = "controller.apply_updates",
        skip(self, manifest),
        fields(level = manifest.level())
    )]
    pub async fn apply_updates(&self, manifest: &UpdateManifest, forced: bool) -> UpdateResult<bool> {
        let Some(_session) = self.begin_session(manifest.level(), forced) else {
            info!(level = manifest.level(), "update already in progress, skipping");
            return Ok(false);
        };

        match self.prepare_level(manifest, forced).await {
            Ok(Prepared::Persisted) => {
                observability::record_update_apply(manifest.level(), forced, "persisted");
                Ok(true)
            }
            Ok(Prepared::NeedsRestart) => self.restart_and_recover(manifest.level(), forced).await,
            Err(err) => {
                observability::record_update_apply(manifest.level(), forced, err.kind());
                self.notifier.publish(&format!(
                    "Applying update level {} failed: {}",
                    manifest.level(),
                    err
                ));
                error!(level = manifest.level(), error = %err, "update apply failed");
                Err(err)
            }
        }
    }

    pub async fn restart_process(&self) -> UpdateResult<bool> {
        let level = self.get_current_level()?;
        let Some(_session) = self.begin_session(level, false) else {
            info!(level = level, "update already in progress, skipping restart");
            return Ok(false);
        };
        self.restart_and_recover(level, false).await
    }

    fn begin_session(&self, level: u64, forced: bool) -> Option<SessionGuard<'_>> {
        let mut slot = lock_or_recover(&self.session);
        if let Some(existing) = slot.as_ref() {
            if !forced {
                return None;
            }
            warn!(
                active_level = existing.level,
                level = level,
                "forced apply while another update is in progress"
            );
            return Some(SessionGuard {
                controller: self,
                owned: false,
            });
        }
        *slot = Some(UpdateSession {
            started_at: Utc::now().to_rfc3339(),
            level,
            forced,
        });
        Some(SessionGuard {
            controller: self,
            owned: true,
        })
    }

    fn set_phase(&self, phase: UpdatePhase) {
        *lock_or_recover(&self.phase) = phase;
    }

    async fn prepare_level(&self, manifest: &UpdateManifest, forced: bool) -> UpdateResult<Prepared> {
        manifest.validate()?;
        let current = self.get_current_level()?;

        self.set_phase(UpdatePhase::Downloading);
        self.download_artifacts(manifest).await?;
        self.remove_deleted_plugins(manifest)?;

        if manifest.is_noop() {
            self.state.save(manifest)?;
            info!(level = manifest.level(), "update level carries no artifacts, persisted");
            return Ok(Prepared::Persisted);
        }

        self.set_phase(UpdatePhase::Snapshotting);
        self.snapshotter.init()?;
        self.snapshotter
            .snapshot(&transition_message(current, manifest.level(), forced))?;

        self.state.save(manifest)?;
        info!(from = current, to = manifest.level(), "update level persisted");
        Ok(Prepared::NeedsRestart)
    }

    // Nothing is installed unless every artifact in the manifest verified.
    async fn download_artifacts(&self, manifest: &UpdateManifest) -> UpdateResult<Vec<DownloadedArtifact>> {
        let policy = self.downloader.policy();
        let plugins_dir = self.plugins_dir();
        let plugin_names = manifest
            .plugins
            .updates
            .iter()
            .map(|plugin| format!("{}.hpi", plugin.artifact_id))
            .collect::<Vec<_>>();

        let mut pending = Vec::new();
        if let Some(core) = &manifest.core {
            pending.push(self.downloader.stage(
                &core.url,
                &self.jenkins_home,
                Some(CORE_FILE_NAME),
                core.checksum.expected_sha256(),
                policy,
            ));
        }
        for (plugin, file_name) in manifest.plugins.updates.iter().zip(&plugin_names) {
            pending.push(self.downloader.stage(
                &plugin.url,
                &plugins_dir,
                Some(file_name.as_str()),
                plugin.checksum.expected_sha256(),
                policy,
            ));
        }

        let staged = join_all(pending)
            .await
            .into_iter()
            .collect::<UpdateResult<Vec<StagedArtifact>>>()?;
        let artifacts = staged
            .into_iter()
            .map(StagedArtifact::promote)
            .collect::<UpdateResult<Vec<_>>>()?;
        info!(
            level = manifest.level(),
            artifacts = artifacts.len(),
            "artifacts downloaded and verified"
        );
        Ok(artifacts)
    }

    fn remove_deleted_plugins(&self, manifest: &UpdateManifest) -> UpdateResult<()> {
        let plugins_dir = self.plugins_dir();
        for name in &manifest.plugins.deletes {
            remove_if_present(&plugins_dir.join(format!("{name}.hpi")), false)?;
            remove_if_present(&plugins_dir.join(name), true)?;
            info!(plugin = %name, "plugin removed");
        }
        Ok(())
    }

    async fn restart_and_recover(&self, level: u64, forced: bool) -> UpdateResult<bool> {
        match self.restart_and_gate().await {
            Ok(()) => {
                observability::record_update_apply(level, forced, "healthy");
                self.set_phase(UpdatePhase::Idle);
                info!(level = level, "update level is live and healthy");
                Ok(true)
            }
            Err(err) if forced => {
                self.fatal(level, forced, &err);
                Ok(false)
            }
            Err(err) => {
                observability::record_update_apply(level, forced, "unhealthy");
                Ok(self.roll_back(level, &err).await)
            }
        }
    }

    // A restart error counts as a failed health check.
    async fn restart_and_gate(&self) -> UpdateResult<()> {
        self.set_phase(UpdatePhase::Restarting);
        if let Err(err) = self.supervisor.restart_process(&self.process_name).await {
            warn!(process = %self.process_name, error = %err, "restart failed");
            return Err(err);
        }

        self.set_phase(UpdatePhase::HealthChecking);
        let report = self.health.check().await;
        if report.healthy {
            Ok(())
        } else {
            Err(UpdateError::HealthCheck(report.message))
        }
    }

    // Runs once per failed apply; the forced re-apply never rolls back again.
    #[instrument(name = "controller.roll_back", skip(self, cause))]
    async fn roll_back(&self, level: u64, cause: &UpdateError) -> bool {
        self.set_phase(UpdatePhase::RollingBack);
        warn!(level = level, error = %cause, "update level unhealthy, rolling back");
        self.notifier
            .publish(&format!("Update level {level} failed ({cause}); rolling back"));

        self.set_phase(UpdatePhase::Tainting);
        if let Err(err) = self.directory.taint(&self.instance_id, level).await {
            warn!(level = level, error = %err, "failed reporting tainted level");
            self.notifier.publish(&format!(
                "Update level {level} could not be reported as tainted ({err}); \
                 the Directory may offer it again"
            ));
        }

        match self.snapshotter.revert_to_level_before(level) {
            Ok(RevertOutcome::Reverted { commit, .. }) => {
                info!(level = level, commit = %commit, "checkpoint restored");
            }
            Ok(outcome) => warn!(level = level, outcome = ?outcome, "no checkpoint restored"),
            Err(err) => warn!(level = level, error = %err, "checkpoint revert failed"),
        }

        self.set_phase(UpdatePhase::RevertQuery);
        let fallback = match self.query().await {
            Ok(Some(fallback)) => fallback,
            Ok(None) => {
                let err =
                    UpdateError::Rollback("directory offered no fallback level".to_string());
                self.fatal(level, false, &err);
                return false;
            }
            Err(err) => {
                let err = UpdateError::Rollback(format!("fallback query failed: {err}"));
                self.fatal(level, false, &err);
                return false;
            }
        };

        self.set_phase(UpdatePhase::RevertApplying);
        if let Err(err) = self.prepare_level(&fallback, true).await {
            let err = UpdateError::Rollback(format!(
                "applying fallback level {} failed: {err}",
                fallback.level()
            ));
            self.fatal(level, false, &err);
            return false;
        }
        if let Err(err) = self.restart_and_gate().await {
            let err = UpdateError::Rollback(format!(
                "fallback level {} unhealthy: {err}",
                fallback.level()
            ));
            self.fatal(level, false, &err);
            return false;
        }

        observability::record_update_apply(fallback.level(), true, "rolled_back");
        self.set_phase(UpdatePhase::Idle);
        self.notifier.publish(&format!(
            "Rolled back from update level {level} to level {}",
            fallback.level()
        ));
        info!(from = level, to = fallback.level(), "rollback completed");
        true
    }

    fn fatal(&self, level: u64, forced: bool, err: &UpdateError) {
        self.set_phase(UpdatePhase::FatalUnrecovered);
        observability::record_update_apply(level, forced, "fatal");
        let update = if forced { "forced update" } else { "update" };
        let message = format!(
            "Instance {} could not recover from {update} level {level}: {err}",
            self.instance_id
        );
        error!(
            level = level,
            forced = forced,
            kind = err.kind(),
            error = %err,
            "update left the instance unrecovered"
        );
        self.notifier.publish(&message);
    }

    fn plugins_dir(&self) -> PathBuf {
        self.jenkins_home.join(PLUGINS_DIR)
    }
}

fn remove_if_present(path: &Path, dir: bool) -> UpdateResult<()> {
    let result = if dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(UpdateError::io_at("removing", path, err)),
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
