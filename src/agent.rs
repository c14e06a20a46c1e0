use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info};

use crate::controller::UpdateController;
use crate::error::UpdateResult;

const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default)]
pub struct AgentRunOptions {
    pub max_cycles: Option<usize>,
    pub shutdown: Option<Arc<AtomicBool>>,
}

impl AgentRunOptions {
    pub fn should_stop(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    UpToDate { level: u64 },
    Applied { level: u64 },
    NotApplied { level: u64 },
}

pub struct UpdateAgent {
    controller: Arc<UpdateController>,
    poll_interval: Duration,
}

impl UpdateAgent {
    pub fn new(controller: Arc<UpdateController>, poll_interval: Duration) -> Self {
        Self {
            controller,
            poll_interval,
        }
    }

    pub fn controller(&self) -> &UpdateController {
        &self.controller
    }

    pub async fn run(&self, options: &AgentRunOptions) -> Result<usize> {
        self.controller
            .prepare()
            .context("failed preparing checkpoint history")?;
        info!(
            instance_id = %self.controller.instance_id(),
            poll_interval_secs = self.poll_interval.as_secs(),
            "update agent started"
        );

        let mut cycles = 0usize;
        while !options.should_stop() {
            match self.run_once().await {
                Ok(outcome) => info!(outcome = ?outcome, "update cycle finished"),
                Err(err) => error!(error = %err, kind = err.kind(), "update cycle failed"),
            }

            cycles += 1;
            if options.max_cycles.is_some_and(|max| cycles >= max) {
                break;
            }
            self.sleep_until_next_cycle(options).await;
        }

        info!(cycles = cycles, "update agent stopped");
        Ok(cycles)
    }

    pub async fn run_once(&self) -> UpdateResult<CycleOutcome> {
        let Some(manifest) = self.controller.query().await? else {
            return Ok(CycleOutcome::UpToDate {
                level: self.controller.get_current_level()?,
            });
        };

        let level = manifest.level();
        if self.controller.apply_updates(&manifest, false).await? {
            Ok(CycleOutcome::Applied { level })
        } else {
            Ok(CycleOutcome::NotApplied { level })
        }
    }

    async fn sleep_until_next_cycle(&self, options: &AgentRunOptions) {
        let deadline = Instant::now() + self.poll_interval;
        loop {
            let now = Instant::now();
            if now >= deadline || options.should_stop() {
                return;
            }
            tokio::time::sleep((deadline - now).min(SHUTDOWN_CHECK_INTERVAL)).await;
        }
    }
}
