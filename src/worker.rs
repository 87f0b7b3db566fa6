//! Worker loop and instance shutdown

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{RunnerError, Result};
use crate::pipeline::{JobOutcome, Pipeline};

/// Host-level power control.
#[async_trait]
pub trait HostControl: Send + Sync {
    async fn power_off(&self) -> Result<()>;
}

/// Runs a shell command (by default `sudo shutdown now -h`) to power off the machine.
#[derive(Debug, Clone)]
pub struct SystemHost {
    command: Vec<String>,
}

impl SystemHost {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl HostControl for SystemHost {
    async fn power_off(&self) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| RunnerError::config("Shutdown command is empty"))?;

        warn!("Powering off host: {}", self.command.join(" "));
        let status = tokio::process::Command::new(program).args(args).status().await?;
        if !status.success() {
            return Err(RunnerError::io(format!("Shutdown command exited with {}", status)));
        }
        Ok(())
    }
}

/// What the loop does after one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A job was taken; dequeue again right away.
    Continue,
    /// No job this cycle; wait before the next dequeue.
    Sleep,
    /// The host is being powered off.
    Stop,
}

pub struct Worker {
    pipeline: Pipeline,
    host: Box<dyn HostControl>,
    idle_sleep: Duration,
    runner_count: u32,
    shutdown_on_empty_queue: bool,
}

impl Worker {
    pub fn new(pipeline: Pipeline, host: Box<dyn HostControl>, config: &WorkerConfig) -> Self {
        Self {
            pipeline,
            host,
            idle_sleep: Duration::from_secs(config.sleep_secs_on_empty_queue),
            runner_count: config.runner_count,
            shutdown_on_empty_queue: config.shutdown_on_empty_queue,
        }
    }

    /// Process jobs until the instance shuts itself down.
    pub async fn run(&self) {
        info!(
            "Worker started (idle sleep {}s, shutdown on empty queue: {})",
            self.idle_sleep.as_secs(),
            self.shutdown_on_empty_queue
        );
        loop {
            match self.step().await {
                Step::Continue => {}
                Step::Sleep => {
                    debug!("Queue empty, sleeping {}s", self.idle_sleep.as_secs());
                    tokio::time::sleep(self.idle_sleep).await;
                }
                Step::Stop => return,
            }
        }
    }

    /// One pipeline cycle plus the decision on what to do next.
    pub async fn step(&self) -> Step {
        let outcome = self.pipeline.run_once().await;
        if let JobOutcome::SafeToShutdown = outcome {
            if !self.shutdown_on_empty_queue {
                debug!("Server allows shutdown, but shutdown on empty queue is disabled");
                return Step::Sleep;
            }
            return match self.shutdown().await {
                Ok(()) => Step::Stop,
                Err(e) => {
                    error!("Power off failed: kind={} {}", e.kind(), e);
                    Step::Sleep
                }
            };
        }
        if outcome.had_job() { Step::Continue } else { Step::Sleep }
    }

    /// Notify the server, then power off. The notice is sent once and its outcome only logged.
    async fn shutdown(&self) -> Result<()> {
        info!("Queue drained and server reports safe to shut down");
        if let Err(e) = self.pipeline.queue().notify_shutdown(self.runner_count).await {
            warn!("Shutdown notice failed: kind={} {}", e.kind(), e);
        }
        self.host.power_off().await
    }
}
