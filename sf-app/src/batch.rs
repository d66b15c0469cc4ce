//! Groups multi-file submissions and flushes them after a quiet period.
//!
//! All access to the pending map goes through one lock: appends, timer
//! flushes and the staleness sweep. A timer only flushes the group if no
//! event arrived since it was scheduled (tracked by `generation`), and the
//! group is removed under the lock before any catalog write starts.

use crate::config::BatchConfig;
use crate::error::FlowError;
use crate::ingest::{EpisodeTarget, Ingestor};
use regex::Regex;
use sf_catalog::EpisodeWrite;
use sf_channels::{ChannelAdapter, ChatId, InboundFile, OutboundMessage};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct FileEvent {
    pub chat_id: ChatId,
    pub caption: String,
    pub file: InboundFile,
    /// Set by the caller when the number is already known; otherwise the
    /// caption is parsed at flush time.
    pub episode: Option<u32>,
}

#[derive(Debug)]
struct PendingGroup {
    chat_id: ChatId,
    target: EpisodeTarget,
    events: Vec<FileEvent>,
    last_update: Instant,
    generation: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub attached: Vec<(u32, EpisodeWrite)>,
    pub malformed: Vec<String>,
    pub failed: Vec<(u32, String)>,
    pub warnings: Vec<(u32, String)>,
}

impl FlushReport {
    pub fn summary(&self, target: &EpisodeTarget) -> String {
        let mut lines = Vec::new();
        if !self.attached.is_empty() {
            let numbers: Vec<String> = self.attached.iter().map(|(n, _)| n.to_string()).collect();
            lines.push(format!(
                "{} season {}: saved episode(s) {}.",
                target.title.title,
                target.season,
                numbers.join(", ")
            ));
        }
        for caption in &self.malformed {
            lines.push(FlowError::MalformedCaption(caption.clone()).user_message());
        }
        for (episode, reason) in &self.failed {
            lines.push(format!("Episode {episode} failed: {reason}"));
        }
        for (episode, warning) in &self.warnings {
            lines.push(format!("Episode {episode}: {warning}."));
        }
        if lines.is_empty() {
            lines.push("No files were processed.".to_string());
        }
        lines.join("\n")
    }
}

/// Largest episode number a caption may name.
pub const MAX_EPISODE_NUMBER: u32 = 9_999;

fn leading_digits(caption: &str) -> Option<&str> {
    static LEADING_NUMBER: OnceLock<Option<Regex>> = OnceLock::new();
    let regex = LEADING_NUMBER
        .get_or_init(|| Regex::new(r"^\s*[Ee]?(\d+)").ok())
        .as_ref()?;
    Some(regex.captures(caption)?.get(1)?.as_str())
}

/// Leading episode number of a caption: "3", "3.mp4", "E03 - Pilot".
/// Zero and anything above [`MAX_EPISODE_NUMBER`] do not count.
pub fn parse_episode_number(caption: &str) -> Option<u32> {
    let number: u32 = leading_digits(caption)?.parse().ok()?;
    (1..=MAX_EPISODE_NUMBER)
        .contains(&number)
        .then_some(number)
}

/// Whether the caption opens with digits, valid episode number or not.
pub fn starts_with_number(caption: &str) -> bool {
    leading_digits(caption).is_some()
}

pub struct BatchAggregator {
    cfg: BatchConfig,
    groups: Arc<Mutex<HashMap<String, PendingGroup>>>,
    ingestor: Arc<Ingestor>,
    channel: Arc<dyn ChannelAdapter>,
    shutdown: CancellationToken,
    background_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl BatchAggregator {
    pub async fn start(
        cfg: BatchConfig,
        ingestor: Arc<Ingestor>,
        channel: Arc<dyn ChannelAdapter>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let aggregator = Arc::new(Self {
            cfg,
            groups: Arc::new(Mutex::new(HashMap::new())),
            ingestor,
            channel,
            shutdown,
            background_tasks: Arc::new(Mutex::new(Vec::new())),
        });
        aggregator.spawn_staleness_sweep().await;
        aggregator
    }

    /// Standalone events (`group_id == None`) are attached right away and
    /// their report returned. Grouped events are held until the group
    /// goes quiet; the chat is told the outcome after the flush.
    #[tracing::instrument(level = "debug", skip_all, fields(group_id = ?group_id, chat_id = %event.chat_id))]
    pub async fn on_file_event(
        self: &Arc<Self>,
        group_id: Option<&str>,
        target: &EpisodeTarget,
        event: FileEvent,
    ) -> Option<FlushReport> {
        let Some(group_id) = group_id else {
            return Some(self.process(target, vec![event]).await);
        };
        if self.shutdown.is_cancelled() {
            tracing::warn!(group_id, "file event after shutdown; processing immediately");
            return Some(self.process(target, vec![event]).await);
        }

        let generation = {
            let mut groups = self.groups.lock().await;
            let group = groups
                .entry(group_id.to_string())
                .or_insert_with(|| PendingGroup {
                    chat_id: event.chat_id.clone(),
                    target: target.clone(),
                    events: Vec::new(),
                    last_update: Instant::now(),
                    generation: 0,
                });
            group.events.push(event);
            group.last_update = Instant::now();
            group.generation += 1;
            group.generation
        };

        self.schedule_flush(group_id.to_string(), generation).await;
        None
    }

    /// Timer tasks are tracked with the sweep so `shutdown` also waits for
    /// a flush that already took its group out of the map.
    async fn schedule_flush(self: &Arc<Self>, group_id: String, generation: u64) {
        let aggregator = self.clone();
        let quiet = Duration::from_millis(self.cfg.quiet_period_ms);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(quiet) => {}
            }
            let group = {
                let mut groups = aggregator.groups.lock().await;
                match groups.get(&group_id) {
                    Some(group) if group.generation == generation => groups.remove(&group_id),
                    _ => None,
                }
            };
            if let Some(group) = group {
                aggregator.flush_group(&group_id, group).await;
            }
        });
        let mut tasks = self.background_tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    async fn flush_group(&self, group_id: &str, group: PendingGroup) {
        tracing::info!(
            group_id,
            chat_id = %group.chat_id,
            files = group.events.len(),
            "flushing batch group"
        );
        let report = self.process(&group.target, group.events).await;
        let summary = report.summary(&group.target);
        if let Err(e) = self
            .channel
            .send(&group.chat_id, OutboundMessage::text(summary))
            .await
        {
            tracing::warn!(error = %e, group_id, "batch report delivery failed");
        }
    }

    /// Attach every event in arrival order.
    async fn process(&self, target: &EpisodeTarget, events: Vec<FileEvent>) -> FlushReport {
        let mut report = FlushReport::default();
        for event in events {
            let Some(episode) = event.episode.or_else(|| parse_episode_number(&event.caption))
            else {
                tracing::warn!(caption = %event.caption, "skipping file with malformed caption");
                report.malformed.push(event.caption);
                continue;
            };
            match self
                .ingestor
                .attach_episode_file(target, episode, &event.file)
                .await
            {
                Ok(receipt) => {
                    if let Some(warning) = receipt.warning() {
                        report.warnings.push((episode, warning));
                    }
                    if let Some(write) = receipt.write {
                        report.attached.push((episode, write));
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, episode, "episode attach failed");
                    report.failed.push((episode, e.user_message()));
                }
            }
        }
        report
    }

    async fn spawn_staleness_sweep(&self) {
        let groups = self.groups.clone();
        let channel = self.channel.clone();
        let staleness = Duration::from_secs(self.cfg.staleness_seconds);
        let every = Duration::from_secs(self.cfg.sweep_interval_seconds);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("batch staleness sweep received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        sweep_stale(&groups, channel.as_ref(), staleness).await;
                    }
                }
            }
        });
        self.background_tasks.lock().await.push(handle);
    }

    pub async fn pending_groups(&self) -> usize {
        self.groups.lock().await.len()
    }

    /// Stop timers and the sweep, then flush or drop what is still pending.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = {
            let mut guard = self.background_tasks.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "batch background task join failed"),
                Err(_) => tracing::warn!("timed out waiting for batch background task shutdown"),
            }
        }

        let pending: Vec<(String, PendingGroup)> = {
            let mut groups = self.groups.lock().await;
            groups.drain().collect()
        };
        if pending.is_empty() {
            return;
        }
        if !self.cfg.flush_on_shutdown {
            let files: usize = pending.iter().map(|(_, g)| g.events.len()).sum();
            tracing::warn!(groups = pending.len(), files, "dropping pending batch groups on shutdown");
            return;
        }
        for (group_id, group) in pending {
            self.flush_group(&group_id, group).await;
        }
    }
}

async fn sweep_stale(
    groups: &Mutex<HashMap<String, PendingGroup>>,
    channel: &dyn ChannelAdapter,
    staleness: Duration,
) -> usize {
    let stale: Vec<(String, PendingGroup)> = {
        let mut groups = groups.lock().await;
        let ids: Vec<String> = groups
            .iter()
            .filter(|(_, group)| group.last_update.elapsed() >= staleness)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| groups.remove(&id).map(|group| (id, group)))
            .collect()
    };
    for (group_id, group) in &stale {
        tracing::warn!(
            group_id = %group_id,
            chat_id = %group.chat_id,
            files = group.events.len(),
            "discarding stale batch group"
        );
        let notice = format!(
            "{} file(s) for {} season {} were discarded before they could be saved. Please send them again.",
            group.events.len(),
            group.target.title.title,
            group.target.season
        );
        if let Err(e) = channel
            .send(&group.chat_id, OutboundMessage::text(notice))
            .await
        {
            tracing::warn!(error = %e, "stale group notice delivery failed");
        }
    }
    stale.len()
}
