use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use super::http::ChatClient;
use crate::core::config::PullConfig;
use crate::core::{ChatError, PullProgress, Result};

/// Polls a model download until it reaches a terminal status. Runs
/// independently of any conversation.
#[derive(Debug)]
pub struct PullMonitor {
    client: ChatClient,
    poll_interval: Duration,
    max_polls: u32,
    progress: watch::Sender<Option<PullProgress>>,
}

impl PullMonitor {
    pub fn new(client: ChatClient, config: &PullConfig) -> Self {
        let (progress, _rx) = watch::channel(None);
        Self {
            client,
            poll_interval: config.poll_interval(),
            max_polls: config.max_polls.max(1),
            progress,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PullProgress>> {
        self.progress.subscribe()
    }

    /// Start pulling `name` and poll until the server reports success or
    /// error. A failed poll is logged and retried on the next tick.
    pub async fn run(&self, name: &str) -> Result<PullProgress> {
        self.client.pull_model(name).await?;
        tracing::info!("Started pull of model {}", name);

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for poll in 1..=self.max_polls {
            ticker.tick().await;
            match self.client.pull_status(name).await {
                Ok(progress) => {
                    tracing::debug!("Pull {} poll {}: {}", name, poll, progress.status);
                    let done = progress.is_terminal();
                    self.progress.send_replace(Some(progress.clone()));
                    if done {
                        tracing::info!("Pull of {} finished with status {}", name, progress.status);
                        return Ok(progress);
                    }
                }
                Err(e) => tracing::warn!("Pull status poll {} for {} failed: {}", poll, name, e),
            }
        }

        Err(ChatError::Timeout(format!(
            "model pull for {} did not finish after {} polls",
            name, self.max_polls
        )))
    }
}
