//! Reminder engine — the scan loop that finds due items and fires them.
//!
//! One driver task ticks on a fixed interval. Each tick takes a single `now`
//! snapshot, fetches the active items, and hands every item to a bounded
//! pool of workers. Work from the previous tick may still be running when
//! the next fetch starts; the delivery tracker and the in-flight set keep
//! the two from firing the same reminder.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chime_core::config::SchedulerConfig;
use chime_core::time::{self, Instant, format_instant};
use chime_core::traits::{ItemSource, LeadTimeEstimator, NotificationSink};
use chime_core::types::{DeliveryOutcome, ItemKey, Notification, OwnerId, ReminderItem};
use futures::StreamExt;
use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::notify::{DeliveryEntry, DeliveryLog};
use crate::tracker::DeliveryTracker;

/// What happened to one item during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// No due instant; never fires.
    NoDueInstant,
    /// Completed task or past event.
    Inactive,
    /// Threshold not reached yet.
    NotDue,
    /// Already fired (or being fired) for this due instant.
    AlreadyClaimed,
    /// Another worker is still busy with this item.
    InFlight,
    /// The item moved or disappeared between fetch and hand-off.
    Rescheduled,
    /// Could not confirm the due instant; retried next tick.
    Skipped,
    /// Handed to the fanout.
    Fired(DeliveryOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemReport {
    pub key: ItemKey,
    /// The estimator was consulted for this item.
    pub estimated: bool,
    pub outcome: ItemOutcome,
}

/// Summary of one tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// `None` when the item fetch failed or timed out.
    pub fetched: Option<usize>,
    /// Rows that could not be read and were skipped.
    pub fetch_errors: usize,
    pub items: Vec<ItemReport>,
}

impl TickReport {
    pub fn fired(&self) -> Vec<ItemKey> {
        self.items
            .iter()
            .filter(|r| matches!(r.outcome, ItemOutcome::Fired(_)))
            .map(|r| r.key)
            .collect()
    }
}

/// Items being estimated or delivered right now.
#[derive(Clone, Default)]
struct InFlightSet {
    keys: Arc<Mutex<HashSet<ItemKey>>>,
}

impl InFlightSet {
    fn enter(&self, key: ItemKey) -> Option<InFlightGuard> {
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        keys.insert(key).then(|| InFlightGuard {
            set: self.clone(),
            key,
        })
    }

    fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Removes its key on drop, including when the worker is aborted.
struct InFlightGuard {
    set: InFlightSet,
    key: ItemKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .keys
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.key);
    }
}

/// The scheduler instance. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ReminderEngine {
    source: Arc<dyn ItemSource>,
    estimator: Arc<dyn LeadTimeEstimator>,
    sink: Arc<dyn NotificationSink>,
    tracker: DeliveryTracker,
    log: Arc<Mutex<DeliveryLog>>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    in_flight: InFlightSet,
}

impl ReminderEngine {
    pub fn new(
        source: Arc<dyn ItemSource>,
        estimator: Arc<dyn LeadTimeEstimator>,
        sink: Arc<dyn NotificationSink>,
        config: SchedulerConfig,
    ) -> Self {
        let workers = config.max_concurrency.max(1);
        Self {
            source,
            estimator,
            sink,
            tracker: DeliveryTracker::new(),
            log: Arc::new(Mutex::new(DeliveryLog::new())),
            config,
            permits: Arc::new(Semaphore::new(workers)),
            in_flight: InFlightSet::default(),
        }
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Number of items currently being estimated or delivered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Recently fired reminders, newest first.
    pub fn recent_deliveries(&self, owner_id: Option<OwnerId>, limit: usize) -> Vec<DeliveryEntry> {
        self.log
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .recent(owner_id, limit)
    }

    /// Forget the firing state of an item (rescheduled, completed or deleted).
    pub fn invalidate(&self, key: ItemKey) {
        if self.tracker.invalidate(key) {
            tracing::debug!("🧹 Delivery state cleared for {key}");
        }
    }

    /// Fetch active items with a timeout. Unreadable rows are logged and skipped.
    async fn fetch(&self, now: Instant) -> Option<(Vec<ReminderItem>, usize)> {
        let query = self.source.list_active_items(now, self.config.lookback());
        let rows = match tokio::time::timeout(self.config.fetch_timeout(), query).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                tracing::warn!("⚠️ Item fetch failed, retrying next tick: {e}");
                return None;
            }
            Err(_) => {
                tracing::warn!(
                    "⏱️ Item fetch timed out after {:?}, retrying next tick",
                    self.config.fetch_timeout()
                );
                return None;
            }
        };

        let mut items = Vec::with_capacity(rows.len());
        let mut errors = 0;
        for row in rows {
            match row {
                Ok(item) => items.push(item),
                Err(e) => {
                    errors += 1;
                    tracing::warn!("⚠️ Skipping unreadable item: {e}");
                }
            }
        }
        Some((items, errors))
    }

    /// Lead time for an item, consulting the estimator once if none is stored.
    async fn lead_minutes(&self, item: &ReminderItem) -> (u32, bool) {
        if let Some(lead) = item.lead_minutes {
            return (lead, false);
        }
        let key = item.key();
        let minutes = self
            .estimator
            .estimate(item.kind, item.description.as_deref())
            .await;
        tracing::debug!("⏳ {key}: lead time {minutes}m via {}", self.estimator.name());
        if let Err(e) = self.source.persist_lead_minutes(key, minutes).await {
            // Used for this tick anyway; the next tick estimates again.
            tracing::warn!("⚠️ Could not persist lead time for {key}: {e}");
        }
        (minutes, true)
    }

    /// Evaluate one item against `now` and fire it if due.
    pub async fn process_item(&self, mut item: ReminderItem, now: Instant) -> ItemReport {
        let key = item.key();
        let report = |estimated, outcome| ItemReport {
            key,
            estimated,
            outcome,
        };

        let Some(due) = item.due_instant else {
            return report(false, ItemOutcome::NoDueInstant);
        };
        if !item.active {
            return report(false, ItemOutcome::Inactive);
        }

        let (lead, estimated) = self.lead_minutes(&item).await;
        item.lead_minutes = Some(lead);
        if !item.threshold_reached(now) {
            return report(estimated, ItemOutcome::NotDue);
        }

        let Some(claim) = self.tracker.claim(key, due) else {
            return report(estimated, ItemOutcome::AlreadyClaimed);
        };

        // Confirm against the store right before hand-off.
        match self.source.due_instant(key, now).await {
            Ok(Some(current)) if current == due => {}
            Ok(current) => {
                tracing::debug!(
                    "🔁 {key} changed since fetch (due now {}), not firing",
                    current.as_ref().map(format_instant).unwrap_or_else(|| "none".into())
                );
                claim.release();
                return report(estimated, ItemOutcome::Rescheduled);
            }
            Err(e) => {
                tracing::warn!("⚠️ Could not confirm due instant for {key}: {e}");
                claim.release();
                return report(estimated, ItemOutcome::Skipped);
            }
        }

        let notification = Notification::for_item(&item, due, lead);
        let outcome = self.sink.deliver(item.owner_id, &notification).await;
        let fired_at = time::now();
        claim.fired(fired_at);

        match outcome {
            DeliveryOutcome::NoRecipient => tracing::info!(
                "🔕 Reminder for {key} '{}' fired, owner {} has no live session",
                item.title,
                item.owner_id
            ),
            DeliveryOutcome::Delivered { failed, .. } if !outcome.reached_anyone() => {
                tracing::warn!(
                    "⚠️ Reminder for {key} fired, all {failed} pushes to owner {} failed",
                    item.owner_id
                )
            }
            DeliveryOutcome::Delivered { delivered, failed } => tracing::info!(
                "🔔 Reminder fired: {key} '{}' → owner {} ({delivered} sent, {failed} failed)",
                item.title,
                item.owner_id
            ),
        }

        self.log
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .record(DeliveryEntry {
                key,
                owner_id: item.owner_id,
                title: item.title,
                due_instant: due,
                fired_at,
                outcome,
            });

        report(estimated, ItemOutcome::Fired(outcome))
    }

    /// `process_item` behind the in-flight set and the worker permits.
    async fn process_tracked(&self, item: ReminderItem, now: Instant) -> ItemReport {
        let key = item.key();
        let Some(_busy) = self.in_flight.enter(key) else {
            return ItemReport {
                key,
                estimated: false,
                outcome: ItemOutcome::InFlight,
            };
        };
        let Ok(_permit) = self.permits.acquire().await else {
            return ItemReport {
                key,
                estimated: false,
                outcome: ItemOutcome::Skipped,
            };
        };
        self.process_item(item, now).await
    }

    /// Run one full tick and wait for every item to settle.
    pub async fn tick(&self, now: Instant) -> TickReport {
        self.prune(now);
        let Some((items, fetch_errors)) = self.fetch(now).await else {
            return TickReport::default();
        };
        let fetched = items.len();
        let items = futures::stream::iter(items)
            .map(|item| self.process_tracked(item, now))
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        TickReport {
            fetched: Some(fetched),
            fetch_errors,
            items,
        }
    }

    fn prune(&self, now: Instant) {
        let pruned = self.tracker.prune(now - self.config.lookback());
        if pruned > 0 {
            tracing::debug!("🧹 Pruned {pruned} delivery records outside the lookback window");
        }
    }

    /// Estimate and store the lead time of a freshly created item in the
    /// background. Skips items that already have one or are being processed.
    pub fn backfill_lead_time(&self, item: ReminderItem) -> Option<JoinHandle<()>> {
        if item.lead_minutes.is_some() || item.due_instant.is_none() || !item.active {
            return None;
        }
        let busy = self.in_flight.enter(item.key())?;
        let engine = self.clone();
        Some(tokio::spawn(async move {
            let _busy = busy;
            engine.lead_minutes(&item).await;
        }))
    }

    /// Start the driver on the current runtime.
    pub fn spawn(&self, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    }

    /// Tick until `shutdown` is notified, then give in-flight deliveries
    /// the configured grace period before abandoning them.
    pub async fn run(self, shutdown: Arc<Notify>) {
        tracing::info!(
            "⏰ Reminder scanner started (every {}s, lookback {}m, {} workers)",
            self.config.interval_secs,
            self.config.lookback_minutes,
            self.config.max_concurrency.max(1)
        );

        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut workers: JoinSet<ItemReport> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = interval.tick() => self.dispatch(time::now(), &mut workers).await,
                Some(joined) = workers.join_next(), if !workers.is_empty() => settle(joined),
            }
        }

        self.drain(workers).await;
        tracing::info!("⏰ Reminder scanner stopped");
    }

    /// Fetch synchronously, then spawn one worker per item.
    async fn dispatch(&self, now: Instant, workers: &mut JoinSet<ItemReport>) {
        self.prune(now);
        let Some((items, _)) = self.fetch(now).await else {
            return;
        };
        tracing::debug!("🔍 Tick at {}: {} active items", format_instant(&now), items.len());
        for item in items {
            let engine = self.clone();
            workers.spawn(async move { engine.process_tracked(item, now).await });
        }
    }

    async fn drain(&self, mut workers: JoinSet<ItemReport>) {
        if workers.is_empty() {
            return;
        }
        let grace = self.config.shutdown_grace();
        tracing::info!("⏳ Waiting up to {grace:?} for {} in-flight reminders", workers.len());
        let finished = tokio::time::timeout(grace, async {
            while let Some(joined) = workers.join_next().await {
                settle(joined);
            }
        })
        .await;
        if finished.is_err() {
            tracing::warn!("⚠️ Abandoning {} in-flight reminders", workers.len());
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
    }
}

fn settle(joined: Result<ItemReport, JoinError>) {
    match joined {
        Ok(report) => tracing::trace!("{} → {:?}", report.key, report.outcome),
        Err(e) if e.is_panic() => tracing::error!("❌ Reminder worker panicked: {e}"),
        Err(_) => {}
    }
}
