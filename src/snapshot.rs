use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use git2::{ErrorCode, IndexAddOption, ObjectType, Oid, Repository, ResetType, Signature};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{UpdateError, UpdateResult};

const AUTHOR_NAME: &str = "evergreen-agent";
const AUTHOR_EMAIL: &str = "evergreen@localhost";
const BASELINE_MESSAGE: &str = "Baseline checkpoint";
const IGNORE_MESSAGE: &str = "Update checkpoint ignore list";
const ROLLBACK_SUFFIX: &str = " (rollback)";

// Paths that are never checkpointed: re-downloadable artifacts, the
// update cache and secret key material.
pub const GITIGNORE_CONTENT: &str = "\
/plugins/
/updates/
/jenkins.war
/secrets/master.key
/secret.key
/secret.key.not-so-secret
/identity.key.enc
*.download
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertOutcome {
    Reverted { commit: String, message: String },
    NotFound,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotEntry {
    pub id: String,
    pub message: String,
    pub time: String,
}

pub fn transition_message(from: u64, to: u64, forced: bool) -> String {
    if forced {
        format!("UL{from}->UL{to}{ROLLBACK_SUFFIX}")
    } else {
        format!("UL{from}->UL{to}")
    }
}

pub fn parse_transition(message: &str) -> Option<(u64, u64)> {
    let token = message.split_whitespace().next()?;
    let (from, to) = token.split_once("->")?;
    let from = from.strip_prefix("UL")?.parse().ok()?;
    let to = to.strip_prefix("UL")?.parse().ok()?;
    Some((from, to))
}

#[derive(Debug, Clone)]
pub struct Snapshotter {
    dir: PathBuf,
    enabled: bool,
}

impl Snapshotter {
    pub fn new(dir: impl AsRef<Path>, enabled: bool) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            enabled,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn init(&self) -> UpdateResult<()> {
        if !self.enabled {
            warn!(dir = %self.dir.display(), "snapshotting disabled, skipping init");
            return Ok(());
        }

        fs::create_dir_all(&self.dir).map_err(|err| UpdateError::io_at("creating", &self.dir, err))?;
        let repo = match Repository::open(&self.dir) {
            Ok(repo) => repo,
            Err(err) if err.code() == ErrorCode::NotFound => self.create_repository()?,
            Err(err) => return Err(err.into()),
        };

        self.ensure_gitignore(&repo)
    }

    pub fn snapshot(&self, message: &str) -> UpdateResult<Option<String>> {
        if !self.enabled {
            warn!(checkpoint = message, "snapshotting disabled, no checkpoint taken");
            return Ok(None);
        }

        let repo = self.open()?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let oid = commit_index(&repo, &mut index, message)?;
        info!(commit = %oid, checkpoint = message, "checkpoint taken");
        Ok(Some(oid.to_string()))
    }

    /// Hard-resets to the newest checkpoint taken on the way into `level`,
    /// which is the last state captured before that level ever ran.
    pub fn revert_to_level_before(&self, level: u64) -> UpdateResult<RevertOutcome> {
        if !self.enabled {
            warn!(level = level, "snapshotting disabled, cannot revert checkpoint");
            return Ok(RevertOutcome::Disabled);
        }

        let repo = self.open()?;
        let Some((oid, message)) = find_checkpoint_into(&repo, level)? else {
            warn!(level = level, "no checkpoint found for level");
            return Ok(RevertOutcome::NotFound);
        };

        let target = repo.find_object(oid, Some(ObjectType::Commit))?;
        repo.reset(&target, ResetType::Hard, None)?;
        info!(commit = %oid, level = level, "working tree reverted");
        Ok(RevertOutcome::Reverted {
            commit: oid.to_string(),
            message,
        })
    }

    pub fn history(&self) -> UpdateResult<Vec<SnapshotEntry>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let repo = self.open()?;
        let mut walk = repo.revwalk()?;
        walk.push_head()?;

        let mut entries = Vec::new();
        for oid in walk {
            let commit = repo.find_commit(oid?)?;
            let time = Utc
                .timestamp_opt(commit.time().seconds(), 0)
                .single()
                .map(|value| value.to_rfc3339())
                .unwrap_or_default();
            entries.push(SnapshotEntry {
                id: commit.id().to_string(),
                message: commit.message().unwrap_or_default().trim().to_string(),
                time,
            });
        }
        Ok(entries)
    }

    fn open(&self) -> UpdateResult<Repository> {
        Repository::open(&self.dir).map_err(|err| {
            if err.code() == ErrorCode::NotFound {
                UpdateError::Snapshot(format!(
                    "no checkpoint history at {}; run init first",
                    self.dir.display()
                ))
            } else {
                err.into()
            }
        })
    }

    fn create_repository(&self) -> UpdateResult<Repository> {
        let repo = Repository::init(&self.dir)?;
        {
            let mut config = repo.config()?;
            config.set_str("user.name", AUTHOR_NAME)?;
            config.set_str("user.email", AUTHOR_EMAIL)?;
        }
        {
            let mut index = repo.index()?;
            commit_index(&repo, &mut index, BASELINE_MESSAGE)?;
        }
        info!(dir = %self.dir.display(), "initialized checkpoint history");
        Ok(repo)
    }

    fn ensure_gitignore(&self, repo: &Repository) -> UpdateResult<()> {
        let path = self.dir.join(".gitignore");
        let current = match fs::read_to_string(&path) {
            Ok(raw) => Some(raw),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(UpdateError::io_at("reading", &path, err)),
        };
        if current.as_deref() == Some(GITIGNORE_CONTENT) {
            debug!("checkpoint ignore list is current");
            return Ok(());
        }

        fs::write(&path, GITIGNORE_CONTENT).map_err(|err| UpdateError::io_at("writing", &path, err))?;
        let mut index = repo.index()?;
        index.add_path(Path::new(".gitignore"))?;
        index.write()?;
        commit_index(repo, &mut index, IGNORE_MESSAGE)?;
        info!("checkpoint ignore list committed");
        Ok(())
    }
}

fn commit_index(repo: &Repository, index: &mut git2::Index, message: &str) -> UpdateResult<Oid> {
    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let signature = repo
        .signature()
        .or_else(|_| Signature::now(AUTHOR_NAME, AUTHOR_EMAIL))?;

    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => None,
        Err(err) => return Err(err.into()),
    };
    let parents = parent.iter().collect::<Vec<_>>();

    let oid = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
    Ok(oid)
}

fn find_checkpoint_into(repo: &Repository, level: u64) -> UpdateResult<Option<(Oid, String)>> {
    let mut walk = repo.revwalk()?;
    walk.push_head()?;
    for oid in walk {
        let oid = oid?;
        let commit = repo.find_commit(oid)?;
        let message = commit.message().unwrap_or_default().trim().to_string();
        if matches!(parse_transition(&message), Some((_, to)) if to == level) {
            return Ok(Some((oid, message)));
        }
    }
    Ok(None)
}
