use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use sha2::{Digest, Sha256};

use evergreen_agent::agent::{AgentRunOptions, CycleOutcome, UpdateAgent};
use evergreen_agent::controller::{UpdateController, UpdateControllerParts, UpdatePhase};
use evergreen_agent::directory::DirectoryApi;
use evergreen_agent::download::Downloader;
use evergreen_agent::error::{UpdateError, UpdateResult};
use evergreen_agent::health::{HealthGate, HealthReport, ProbeResult};
use evergreen_agent::manifest::{Checksum, PluginUpdate, UpdateManifest};
use evergreen_agent::notify::RecordingNotifier;
use evergreen_agent::retry::RetryPolicy;
use evergreen_agent::snapshot::Snapshotter;
use evergreen_agent::state::PersistentState;
use evergreen_agent::supervisor::{ProcessControl, ProcessInfo, ProcessSupervisor};

const PLUGIN_BODY: &[u8] = b"plugin-x-bytes";

#[derive(Default)]
struct FakeDirectory {
    offers: Mutex<VecDeque<UpdateManifest>>,
    calls: Mutex<Vec<String>>,
    reject_taints: AtomicBool,
}

impl FakeDirectory {
    fn offer(&self, manifest: UpdateManifest) {
        self.offers.lock().expect("offers").push_back(manifest);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }
}

#[async_trait]
impl DirectoryApi for FakeDirectory {
    async fn query(&self, _instance_id: &str, level: u64) -> UpdateResult<Option<UpdateManifest>> {
        self.calls.lock().expect("calls").push(format!("query:{level}"));
        Ok(self.offers.lock().expect("offers").pop_front())
    }

    async fn taint(&self, _instance_id: &str, level: u64) -> UpdateResult<()> {
        self.calls.lock().expect("calls").push(format!("taint:{level}"));
        if self.reject_taints.load(Ordering::SeqCst) {
            return Err(UpdateError::Network {
                url: "http://directory/update/tainted".to_string(),
                attempts: 1,
                message: "http_status=503".to_string(),
            });
        }
        Ok(())
    }
}

/// Answers from a script; healthy once the script runs out.
#[derive(Default)]
struct ScriptedHealth {
    script: Mutex<VecDeque<bool>>,
    checks: Mutex<usize>,
}

impl ScriptedHealth {
    fn with_script(script: &[bool]) -> Self {
        Self {
            script: Mutex::new(script.iter().copied().collect()),
            checks: Mutex::new(0),
        }
    }

    fn checks(&self) -> usize {
        *self.checks.lock().expect("checks")
    }
}

fn probe(name: &str, ok: bool) -> ProbeResult {
    ProbeResult {
        name: name.to_string(),
        ok,
        attempts: 1,
        error: (!ok).then(|| "scripted failure".to_string()),
    }
}

#[async_trait]
impl HealthGate for ScriptedHealth {
    async fn check(&self) -> HealthReport {
        *self.checks.lock().expect("checks") += 1;
        let healthy = self.script.lock().expect("script").pop_front().unwrap_or(true);
        HealthReport {
            healthy,
            message: if healthy {
                "ok".to_string()
            } else {
                "plugins probe failed".to_string()
            },
            identity: probe("identity", true),
            metrics: probe("metrics", healthy),
        }
    }
}

/// Records `config.xml` as each start finds it, then rewrites it the way a
/// freshly started instance would.
struct RecordingControl {
    calls: Arc<Mutex<Vec<String>>>,
    configs_at_start: Arc<Mutex<Vec<String>>>,
    jenkins_home: PathBuf,
    failing_starts: Mutex<usize>,
}

#[async_trait]
impl ProcessControl for RecordingControl {
    async fn get_state(&self) -> UpdateResult<String> {
        Ok("RUNNING".to_string())
    }

    async fn get_process_info(&self, name: &str) -> UpdateResult<ProcessInfo> {
        Ok(ProcessInfo {
            name: name.to_string(),
            statename: "RUNNING".to_string(),
            pid: 1,
            description: String::new(),
        })
    }

    async fn start_process(&self, name: &str) -> UpdateResult<bool> {
        let starts = {
            let mut calls = self.calls.lock().expect("calls");
            calls.push(format!("start:{name}"));
            calls.iter().filter(|call| call.starts_with("start:")).count()
        };
        let config = self.jenkins_home.join("config.xml");
        self.configs_at_start
            .lock()
            .expect("configs")
            .push(fs::read_to_string(&config).unwrap_or_default());

        let mut failing = self.failing_starts.lock().expect("failing starts");
        if *failing > 0 {
            *failing -= 1;
            return Err(UpdateError::ProcessControl(format!(
                "SPAWN_ERROR: could not start '{name}'"
            )));
        }
        fs::create_dir_all(&self.jenkins_home).expect("jenkins home");
        fs::write(&config, format!("written by start {starts}")).expect("write config");
        Ok(true)
    }

    async fn stop_process(&self, name: &str) -> UpdateResult<bool> {
        self.calls.lock().expect("calls").push(format!("stop:{name}"));
        Ok(true)
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    jenkins_home: PathBuf,
    controller: Arc<UpdateController>,
    directory: Arc<FakeDirectory>,
    health: Arc<ScriptedHealth>,
    notifier: Arc<RecordingNotifier>,
    process_calls: Arc<Mutex<Vec<String>>>,
    configs_at_start: Arc<Mutex<Vec<String>>>,
    artifacts: String,
}

impl Harness {
    async fn new(health_script: &[bool]) -> Self {
        Self::with_failing_starts(health_script, 0).await
    }

    async fn with_failing_starts(health_script: &[bool], failing_starts: usize) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let jenkins_home = dir.path().join("jenkins_home");
        let directory = Arc::new(FakeDirectory::default());
        let health = Arc::new(ScriptedHealth::with_script(health_script));
        let notifier = Arc::new(RecordingNotifier::new());
        let process_calls = Arc::new(Mutex::new(Vec::new()));
        let configs_at_start = Arc::new(Mutex::new(Vec::new()));

        let controller = UpdateController::new(UpdateControllerParts {
            directory: directory.clone(),
            downloader: Downloader::new(Duration::from_secs(5), RetryPolicy::new(0, 1, 1.0))
                .expect("downloader"),
            health: health.clone(),
            snapshotter: Snapshotter::new(&jenkins_home, true),
            supervisor: ProcessSupervisor::new(Box::new(RecordingControl {
                calls: process_calls.clone(),
                configs_at_start: configs_at_start.clone(),
                jenkins_home: jenkins_home.clone(),
                failing_starts: Mutex::new(failing_starts),
            })),
            state: PersistentState::new(dir.path().join("data")),
            notifier: notifier.clone(),
            jenkins_home: jenkins_home.clone(),
            process_name: "jenkins".to_string(),
            instance_id: "instance-1".to_string(),
        });

        Self {
            _dir: dir,
            jenkins_home,
            controller: Arc::new(controller),
            directory,
            health,
            notifier,
            process_calls,
            configs_at_start,
            artifacts: start_artifact_server().await,
        }
    }

    fn restarts(&self) -> usize {
        self.process_calls
            .lock()
            .expect("calls")
            .iter()
            .filter(|call| call.starts_with("start:"))
            .count()
    }

    fn configs_at_start(&self) -> Vec<String> {
        self.configs_at_start.lock().expect("configs").clone()
    }

    fn seed_level_one(&self) {
        fs::create_dir_all(&self.jenkins_home).expect("jenkins home");
        fs::write(self.jenkins_home.join("config.xml"), "seeded").expect("seed config");
        self.controller
            .state()
            .save(&UpdateManifest::new(1, "general"))
            .expect("seed level 1");
    }

    fn plugin_update(&self, artifact_id: &str, path: &str, signature: String) -> PluginUpdate {
        PluginUpdate {
            artifact_id: artifact_id.to_string(),
            url: format!("{}/{}", self.artifacts, path),
            checksum: Checksum::sha256(signature),
        }
    }

    fn plugin_manifest(&self, level: u64, path: &str, signature: String) -> UpdateManifest {
        let mut manifest = UpdateManifest::new(level, "general");
        manifest
            .plugins
            .updates
            .push(self.plugin_update("x", path, signature));
        manifest
    }
}

async fn start_artifact_server() -> String {
    let app = Router::new()
        .route("/x.hpi", get(|| async { PLUGIN_BODY }))
        .route(
            "/slow.hpi",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                PLUGIN_BODY
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("listener addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve test server");
    });
    format!("http://{addr}")
}

fn plugin_sha256() -> String {
    let digest = Sha256::digest(PLUGIN_BODY);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[tokio::test]
async fn empty_manifest_is_persisted_without_restart() {
    let harness = Harness::new(&[]).await;

    let applied = harness
        .controller
        .apply_updates(&UpdateManifest::new(1, "general"), false)
        .await
        .expect("apply");

    assert!(applied);
    assert_eq!(harness.controller.get_current_level().expect("level"), 1);
    assert_eq!(harness.restarts(), 0);
    assert_eq!(harness.health.checks(), 0);
    assert_eq!(harness.controller.phase(), UpdatePhase::Idle);
}

#[tokio::test]
async fn plugin_update_is_installed_end_to_end() {
    let harness = Harness::new(&[]).await;
    let manifest = harness.plugin_manifest(1, "x.hpi", plugin_sha256());

    let applied = harness
        .controller
        .apply_updates(&manifest, false)
        .await
        .expect("apply");
    assert!(applied);

    let installed = harness.jenkins_home.join("plugins/x.hpi");
    assert_eq!(fs::read(&installed).expect("plugin"), PLUGIN_BODY);
    assert_eq!(harness.controller.get_current_level().expect("level"), 1);
    assert_eq!(
        harness.controller.state().audit_records().expect("audit").len(),
        1
    );
    assert_eq!(harness.restarts(), 1);
    assert_eq!(harness.health.checks(), 1);

    let history = harness.controller.snapshotter().history().expect("history");
    assert_eq!(history[0].message, "UL0->UL1");
    assert!(harness.controller.current_session().is_none());
}

#[tokio::test]
async fn deletes_remove_plugin_archive_and_exploded_dir() {
    let harness = Harness::new(&[]).await;
    let plugins = harness.jenkins_home.join("plugins");
    fs::create_dir_all(plugins.join("old/WEB-INF")).expect("exploded dir");
    fs::write(plugins.join("old.hpi"), "old").expect("archive");

    let mut manifest = UpdateManifest::new(1, "general");
    manifest.plugins.deletes.push("old".to_string());
    assert!(harness
        .controller
        .apply_updates(&manifest, false)
        .await
        .expect("apply"));

    assert!(!plugins.join("old.hpi").exists());
    assert!(!plugins.join("old").exists());
    assert_eq!(harness.restarts(), 1);
}

#[tokio::test]
async fn checksum_mismatch_aborts_before_persisting() {
    let harness = Harness::new(&[]).await;
    let manifest = harness.plugin_manifest(1, "x.hpi", "0".repeat(64));

    let err = harness
        .controller
        .apply_updates(&manifest, false)
        .await
        .expect_err("checksum must fail");

    assert_eq!(err.kind(), "checksum_mismatch");
    assert!(!harness.jenkins_home.join("plugins/x.hpi").exists());
    assert!(!harness.jenkins_home.join("plugins/x.hpi.download").exists());
    assert_eq!(harness.controller.get_current_level().expect("level"), 0);
    assert!(harness.controller.state().audit_records().expect("audit").is_empty());
    assert_eq!(harness.restarts(), 0);
    assert_eq!(harness.notifier.messages().len(), 1);
    assert_eq!(harness.controller.phase(), UpdatePhase::Idle);
}

#[tokio::test]
async fn failed_sibling_download_installs_nothing() {
    let harness = Harness::new(&[]).await;
    let plugins = harness.jenkins_home.join("plugins");
    fs::create_dir_all(&plugins).expect("plugins dir");
    fs::write(plugins.join("x.hpi"), "old-x").expect("seed plugin");

    let mut manifest = harness.plugin_manifest(1, "x.hpi", plugin_sha256());
    manifest
        .plugins
        .updates
        .push(harness.plugin_update("y", "slow.hpi", "0".repeat(64)));

    let err = harness
        .controller
        .apply_updates(&manifest, false)
        .await
        .expect_err("checksum must fail");

    assert_eq!(err.kind(), "checksum_mismatch");
    assert_eq!(fs::read_to_string(plugins.join("x.hpi")).expect("plugin"), "old-x");
    assert!(!plugins.join("y.hpi").exists());
    assert!(!plugins.join("x.hpi.download").exists());
    assert!(!plugins.join("y.hpi.download").exists());
    assert_eq!(harness.controller.get_current_level().expect("level"), 0);
    assert_eq!(harness.restarts(), 0);
}

#[tokio::test]
async fn artifact_ids_with_surrounding_whitespace_are_rejected() {
    let harness = Harness::new(&[]).await;
    let plugins = harness.jenkins_home.join("plugins");
    fs::create_dir_all(&plugins).expect("plugins dir");
    fs::write(plugins.join("old.hpi"), "old").expect("seed plugin");

    let mut manifest = UpdateManifest::new(1, "general");
    manifest
        .plugins
        .updates
        .push(harness.plugin_update("x ", "x.hpi", plugin_sha256()));
    let err = harness
        .controller
        .apply_updates(&manifest, false)
        .await
        .expect_err("padded id");
    assert_eq!(err.kind(), "manifest_format");

    let mut manifest = UpdateManifest::new(1, "general");
    manifest.plugins.deletes.push(" old".to_string());
    let err = harness
        .controller
        .apply_updates(&manifest, false)
        .await
        .expect_err("padded delete");
    assert_eq!(err.kind(), "manifest_format");

    let mut names = fs::read_dir(&plugins)
        .expect("plugins dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    names.sort();
    assert_eq!(names, vec!["old.hpi"]);
    assert_eq!(harness.controller.get_current_level().expect("level"), 0);
}

#[tokio::test]
async fn unhealthy_level_is_tainted_and_rolled_back() {
    let harness = Harness::new(&[false]).await;
    harness.seed_level_one();
    harness
        .directory
        .offer(harness.plugin_manifest(1, "x.hpi", plugin_sha256()));

    let manifest = harness.plugin_manifest(2, "x.hpi", plugin_sha256());
    let recovered = harness
        .controller
        .apply_updates(&manifest, false)
        .await
        .expect("apply");

    assert!(recovered);
    assert_eq!(harness.directory.calls(), vec!["taint:2", "query:2"]);
    assert_eq!(harness.controller.get_current_level().expect("level"), 1);
    assert_eq!(harness.restarts(), 2);
    assert_eq!(harness.health.checks(), 2);
    assert_eq!(harness.controller.phase(), UpdatePhase::Idle);

    let history = harness.controller.snapshotter().history().expect("history");
    assert_eq!(history[0].message, "UL2->UL1 (rollback)");
    assert!(harness.notifier.messages()[0].contains("rolling back"));
    assert_eq!(harness.configs_at_start(), vec!["seeded", "seeded"]);
}

#[tokio::test]
async fn restart_error_counts_as_failed_health_check() {
    let harness = Harness::with_failing_starts(&[], 1).await;
    harness.seed_level_one();
    harness
        .directory
        .offer(harness.plugin_manifest(1, "x.hpi", plugin_sha256()));

    let manifest = harness.plugin_manifest(2, "x.hpi", plugin_sha256());
    let recovered = harness
        .controller
        .apply_updates(&manifest, false)
        .await
        .expect("apply");

    assert!(recovered);
    assert_eq!(harness.directory.calls(), vec!["taint:2", "query:2"]);
    assert_eq!(harness.controller.get_current_level().expect("level"), 1);
    assert_eq!(harness.restarts(), 2);
    assert_eq!(harness.health.checks(), 1);
    assert_eq!(harness.configs_at_start(), vec!["seeded", "seeded"]);
    assert!(harness.notifier.messages()[0].contains("SPAWN_ERROR"));
    assert_eq!(harness.controller.phase(), UpdatePhase::Idle);
}

#[tokio::test]
async fn rejected_taint_is_reported_to_the_operator() {
    let harness = Harness::new(&[false]).await;
    harness.seed_level_one();
    harness.directory.reject_taints.store(true, Ordering::SeqCst);
    harness
        .directory
        .offer(harness.plugin_manifest(1, "x.hpi", plugin_sha256()));

    let recovered = harness
        .controller
        .apply_updates(&harness.plugin_manifest(2, "x.hpi", plugin_sha256()), false)
        .await
        .expect("apply");

    assert!(recovered);
    assert_eq!(harness.directory.calls(), vec!["taint:2", "query:2"]);
    let messages = harness.notifier.messages();
    assert!(
        messages
            .iter()
            .any(|message| message.contains("could not be reported as tainted")
                && message.contains("http_status=503")),
        "{messages:?}"
    );
}

#[tokio::test]
async fn forced_apply_failure_is_fatal_without_rollback() {
    let harness = Harness::new(&[false]).await;

    let applied = harness
        .controller
        .apply_updates(&harness.plugin_manifest(1, "x.hpi", plugin_sha256()), true)
        .await
        .expect("fatal is not an error");

    assert!(!applied);
    assert!(harness.directory.calls().is_empty());
    assert_eq!(harness.restarts(), 1);
    assert_eq!(harness.controller.phase(), UpdatePhase::FatalUnrecovered);
    let messages = harness.notifier.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("could not recover from forced update level 1"));
    assert!(messages[0].contains("health check failed"));
}

#[tokio::test]
async fn second_failure_is_fatal_and_not_retried() {
    let harness = Harness::new(&[false, false]).await;
    harness.directory.offer(UpdateManifest::new(1, "general"));

    let manifest = harness.plugin_manifest(2, "x.hpi", plugin_sha256());
    let applied = harness
        .controller
        .apply_updates(&manifest, false)
        .await
        .expect("fatal is not an error");

    assert!(!applied);
    assert_eq!(harness.controller.phase(), UpdatePhase::FatalUnrecovered);
    assert_eq!(harness.directory.calls(), vec!["taint:2", "query:2"]);
    assert_eq!(harness.restarts(), 2);
    let messages = harness.notifier.messages();
    assert!(messages
        .last()
        .expect("fatal notification")
        .contains("could not recover from update level 2"));
}

#[tokio::test]
async fn missing_fallback_is_fatal() {
    let harness = Harness::new(&[false]).await;
    let manifest = harness.plugin_manifest(1, "x.hpi", plugin_sha256());

    let applied = harness
        .controller
        .apply_updates(&manifest, false)
        .await
        .expect("apply");

    assert!(!applied);
    assert_eq!(harness.restarts(), 1);
    assert_eq!(harness.controller.phase(), UpdatePhase::FatalUnrecovered);
    assert!(harness.controller.current_session().is_none());
}

#[tokio::test]
async fn concurrent_applies_run_exactly_once() {
    let harness = Harness::new(&[]).await;
    let manifest = harness.plugin_manifest(1, "slow.hpi", plugin_sha256());

    let (first, second) = tokio::join!(
        harness.controller.apply_updates(&manifest, false),
        harness.controller.apply_updates(&manifest, false)
    );
    let mut results = vec![first.expect("first"), second.expect("second")];
    results.sort();

    assert_eq!(results, vec![false, true]);
    assert_eq!(harness.restarts(), 1);
    assert_eq!(
        harness.controller.state().audit_records().expect("audit").len(),
        1
    );
}

#[tokio::test]
async fn agent_cycle_applies_offered_level() {
    let harness = Harness::new(&[]).await;
    harness
        .directory
        .offer(harness.plugin_manifest(3, "x.hpi", plugin_sha256()));
    let agent = UpdateAgent::new(harness.controller.clone(), Duration::ZERO);

    assert_eq!(
        agent.run_once().await.expect("cycle"),
        CycleOutcome::Applied { level: 3 }
    );
    assert_eq!(
        agent.run_once().await.expect("cycle"),
        CycleOutcome::UpToDate { level: 3 }
    );
}

#[tokio::test]
async fn agent_loop_honors_cycle_limit() {
    let harness = Harness::new(&[]).await;
    let agent = UpdateAgent::new(harness.controller.clone(), Duration::ZERO);

    let cycles = agent
        .run(&AgentRunOptions {
            max_cycles: Some(2),
            shutdown: None,
        })
        .await
        .expect("run");

    assert_eq!(cycles, 2);
    assert_eq!(harness.directory.calls(), vec!["query:0", "query:0"]);
    assert!(harness.jenkins_home.join(".git").exists());
}

#[tokio::test]
async fn failed_cycle_notifies_the_operator_once() {
    let harness = Harness::new(&[]).await;
    harness
        .directory
        .offer(harness.plugin_manifest(1, "x.hpi", "0".repeat(64)));
    let agent = UpdateAgent::new(harness.controller.clone(), Duration::ZERO);

    let cycles = agent
        .run(&AgentRunOptions {
            max_cycles: Some(1),
            shutdown: None,
        })
        .await
        .expect("run");

    assert_eq!(cycles, 1);
    let messages = harness.notifier.messages();
    assert_eq!(messages.len(), 1, "{messages:?}");
    assert!(messages[0].contains("Applying update level 1 failed"));
}
