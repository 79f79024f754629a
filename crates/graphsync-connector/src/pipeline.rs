//! The sync pipeline: feed → router → executor, with checkpointing.
//!
//! Events are read and translated in feed order. Applies run as tokio tasks
//! up to `max_in_flight` at once, but never two at a time on the same graph
//! entity: an event whose entities are busy waits, and reading pauses
//! behind it. Every event gets a sequence number, and the checkpoint only
//! moves over the contiguous prefix of finished events, so a crash never
//! skips an event whose apply wasn't confirmed.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use graphsync_core::{
    Ack, ChangeEvent, ChangeOp, EntityIdentity, EntityKey, ExecError, FeedPosition, Mutation,
    MutationExecutor, SyncSettings,
};

use crate::checkpoint::{CheckpointError, CheckpointStore, CheckpointTracker};
use crate::config::PipelineConfig;
use crate::error::{self, SyncError, TranslationError};
use crate::feed::ChangeFeed;
use crate::identity::IdentityMapper;
use crate::router::ChangeRouter;

/// Everything a run needs, built once at startup.
#[derive(Clone)]
pub struct SyncContext {
    pub settings: Arc<SyncSettings>,
    pub mapper: IdentityMapper,
    pub executor: Arc<dyn MutationExecutor>,
}

/// What happened to one event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// Translated and applied.
    Routed {
        mutation: &'static str,
        ack: Ack,
        attempts: u32,
    },
    /// Outside the routed namespaces.
    Ignored,
    /// Could not be translated; skipped.
    TranslationError(TranslationError),
    /// Apply failed for good; skipped.
    ExecError { error: ExecError, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventReport {
    pub namespace: String,
    pub op: ChangeOp,
    pub position: FeedPosition,
    pub identity: Option<EntityIdentity>,
    pub outcome: EventOutcome,
}

/// Totals for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub events: u64,
    pub applied: u64,
    pub noops: u64,
    pub ignored: u64,
    pub translation_errors: u64,
    pub exec_errors: u64,
    pub retries: u64,
    /// Resume position at the end of the run.
    pub checkpoint: Option<FeedPosition>,
}

pub struct Pipeline {
    router: ChangeRouter,
    mapper: IdentityMapper,
    executor: Arc<dyn MutationExecutor>,
    config: Arc<PipelineConfig>,
    store: Arc<dyn CheckpointStore>,
    reports: Option<UnboundedSender<EventReport>>,
}

/// Feed metadata of an event, kept for reporting.
#[derive(Debug, Clone)]
struct EventMeta {
    namespace: String,
    op: ChangeOp,
    position: FeedPosition,
}

impl EventMeta {
    fn of(event: &ChangeEvent) -> Self {
        Self {
            namespace: event.namespace.clone(),
            op: event.op,
            position: event.timestamp,
        }
    }
}

/// A translated event waiting for its entities to be free.
struct Pending {
    seq: u64,
    meta: EventMeta,
    mutation: Mutation,
    keys: Vec<EntityKey>,
}

/// Result of an apply task.
struct Applied {
    seq: u64,
    meta: EventMeta,
    mutation: Mutation,
    keys: Vec<EntityKey>,
    result: Result<Ack, ExecError>,
    attempts: u32,
}

struct Slot {
    seq: u64,
    position: FeedPosition,
    done: bool,
}

struct RunState {
    window: VecDeque<Slot>,
    busy: HashSet<EntityKey>,
    tracker: CheckpointTracker,
    stats: SyncStats,
    next_seq: u64,
    consecutive_failures: u32,
    last_saved: Option<FeedPosition>,
}

impl RunState {
    fn new(start: Option<FeedPosition>) -> Self {
        Self {
            window: VecDeque::new(),
            busy: HashSet::new(),
            tracker: CheckpointTracker::new(start),
            stats: SyncStats::default(),
            next_seq: 0,
            consecutive_failures: 0,
            last_saved: start,
        }
    }

    fn open(&mut self, position: FeedPosition) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.window.push_back(Slot {
            seq,
            position,
            done: false,
        });
        seq
    }

    /// Mark an event finished and advance the tracker over the finished prefix.
    ///
    /// Adjacent finished slots collapse into the later one, since only the
    /// last position of a finished run can become the checkpoint. The window
    /// therefore holds at most one finished slot per unfinished one, however
    /// many ignored events queue up behind a slow apply.
    fn complete(&mut self, seq: u64) {
        let Ok(i) = self.window.binary_search_by_key(&seq, |s| s.seq) else {
            return;
        };
        self.window[i].done = true;
        if self.window.get(i + 1).is_some_and(|s| s.done) {
            self.window.remove(i);
        }
        if i > 0 && self.window[i - 1].done {
            self.window.remove(i - 1);
        }

        while self.window.front().is_some_and(|s| s.done) {
            if let Some(slot) = self.window.pop_front() {
                self.tracker.advance(slot.position);
            }
        }
    }

    fn is_blocked(&self, pending: &Pending) -> bool {
        pending.keys.iter().any(|k| self.busy.contains(k))
    }
}

enum Exit {
    FeedDone,
    Shutdown,
    Failed(SyncError),
}

impl Pipeline {
    pub fn new(ctx: SyncContext, config: PipelineConfig, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            router: ChangeRouter::new(ctx.settings, ctx.mapper),
            mapper: ctx.mapper,
            executor: ctx.executor,
            config: Arc::new(config),
            store,
            reports: None,
        }
    }

    /// Send a report for every event to `tx`.
    pub fn with_reports(mut self, tx: UnboundedSender<EventReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    /// Run until the feed ends, `shutdown` resolves, or the executor is
    /// declared unavailable. `start` is the resume position the feed was
    /// opened at.
    ///
    /// The checkpoint is persisted periodically and once more before
    /// returning, on success and on failure alike.
    pub async fn run<F, S>(
        &self,
        feed: &mut F,
        start: Option<FeedPosition>,
        shutdown: S,
    ) -> error::Result<SyncStats>
    where
        F: ChangeFeed + ?Sized,
        S: Future<Output = ()>,
    {
        let mut state = RunState::new(start);
        let mut tasks: JoinSet<Applied> = JoinSet::new();
        let mut pending: Option<Pending> = None;
        let mut feed_done = false;

        let period = self.config.checkpoint_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(
            start = ?start,
            max_in_flight = self.config.max_in_flight,
            "Sync pipeline started"
        );

        let exit = loop {
            if let Some(p) = pending.take() {
                if state.is_blocked(&p) || tasks.len() >= self.config.max_in_flight {
                    pending = Some(p);
                } else {
                    self.spawn(&mut state, &mut tasks, p);
                }
            }

            if feed_done && pending.is_none() && tasks.is_empty() {
                break Exit::FeedDone;
            }

            let can_read =
                !feed_done && pending.is_none() && tasks.len() < self.config.max_in_flight;

            tokio::select! {
                biased;

                _ = &mut shutdown => break Exit::Shutdown,

                _ = ticker.tick() => {
                    if let Err(e) = self.persist(&mut state) {
                        tracing::warn!(error = %e, "Failed to persist checkpoint");
                    }
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let finished = match joined {
                        Ok(applied) => self.finish(&mut state, applied),
                        Err(e) => Err(SyncError::Task(e)),
                    };
                    if let Err(e) = finished {
                        break Exit::Failed(e);
                    }
                }

                next = feed.next_event(), if can_read => match next {
                    Ok(Some(event)) => pending = self.admit(&mut state, event),
                    Ok(None) => {
                        tracing::info!(events = state.stats.events, "Change feed exhausted");
                        feed_done = true;
                    }
                    Err(e) => break Exit::Failed(e.into()),
                },
            }
        };

        let result = match exit {
            Exit::FeedDone => Ok(()),
            Exit::Shutdown => {
                tracing::info!(in_flight = tasks.len(), "Shutdown requested, draining");
                self.drain(&mut state, &mut tasks).await
            }
            Exit::Failed(e) => Err(e),
        };
        tasks.shutdown().await;

        let saved = self.persist(&mut state);
        state.stats.checkpoint = state.tracker.current();
        let stats = state.stats;

        tracing::info!(
            events = stats.events,
            applied = stats.applied,
            noops = stats.noops,
            ignored = stats.ignored,
            translation_errors = stats.translation_errors,
            exec_errors = stats.exec_errors,
            retries = stats.retries,
            checkpoint = ?stats.checkpoint,
            "Sync pipeline stopped"
        );

        match (result, saved) {
            (Err(e), saved) => {
                if let Err(save_err) = saved {
                    tracing::warn!(error = %save_err, "Failed to persist checkpoint");
                }
                Err(e)
            }
            (Ok(()), Err(e)) => Err(e.into()),
            (Ok(()), Ok(())) => Ok(stats),
        }
    }

    /// Translate a freshly read event. Events that need no apply are
    /// finished on the spot.
    fn admit(&self, state: &mut RunState, event: ChangeEvent) -> Option<Pending> {
        state.stats.events += 1;
        let meta = EventMeta::of(&event);
        let seq = state.open(meta.position);

        match self.router.dispatch(&event) {
            Ok(Some(mutation)) => {
                let keys = mutation.touched();
                Some(Pending {
                    seq,
                    meta,
                    mutation,
                    keys,
                })
            }
            Ok(None) => {
                state.stats.ignored += 1;
                tracing::trace!(namespace = %meta.namespace, "Ignoring change event");
                self.report(meta, None, EventOutcome::Ignored);
                state.complete(seq);
                None
            }
            Err(e) => {
                state.stats.translation_errors += 1;
                let identity = self.mapper.event_identity(&event);
                tracing::warn!(
                    namespace = %meta.namespace,
                    op = meta.op.as_str(),
                    position = %meta.position,
                    identity = ?identity.as_ref().map(EntityIdentity::as_str),
                    error = %e,
                    "Skipping untranslatable change event"
                );
                self.report(meta, identity, EventOutcome::TranslationError(e));
                state.complete(seq);
                None
            }
        }
    }

    fn spawn(&self, state: &mut RunState, tasks: &mut JoinSet<Applied>, pending: Pending) {
        state.busy.extend(pending.keys.iter().cloned());

        let executor = Arc::clone(&self.executor);
        let config = Arc::clone(&self.config);
        tasks.spawn(async move {
            let (result, attempts) =
                apply_with_retry(executor.as_ref(), &pending.mutation, &config).await;
            Applied {
                seq: pending.seq,
                meta: pending.meta,
                mutation: pending.mutation,
                keys: pending.keys,
                result,
                attempts,
            }
        });
    }

    /// Record a finished apply. Fails once too many events in a row have
    /// exhausted their retries.
    fn finish(&self, state: &mut RunState, applied: Applied) -> error::Result<()> {
        for key in &applied.keys {
            state.busy.remove(key);
        }
        state.stats.retries += u64::from(applied.attempts.saturating_sub(1));
        let identity = applied.mutation.identity().clone();

        match applied.result {
            Ok(ack) => {
                state.consecutive_failures = 0;
                match ack {
                    Ack::Applied => state.stats.applied += 1,
                    Ack::Noop => state.stats.noops += 1,
                }
                self.report(
                    applied.meta,
                    Some(identity),
                    EventOutcome::Routed {
                        mutation: applied.mutation.kind(),
                        ack,
                        attempts: applied.attempts,
                    },
                );
            }
            Err(error) => {
                state.stats.exec_errors += 1;
                tracing::error!(
                    namespace = %applied.meta.namespace,
                    op = applied.meta.op.as_str(),
                    identity = %identity,
                    mutation = applied.mutation.kind(),
                    attempts = applied.attempts,
                    error = %error,
                    "Apply failed, skipping event"
                );

                self.report(
                    applied.meta,
                    Some(identity),
                    EventOutcome::ExecError {
                        error: error.clone(),
                        attempts: applied.attempts,
                    },
                );

                if error.is_retryable() {
                    state.consecutive_failures += 1;
                    let limit = self.config.max_consecutive_failures;
                    if limit > 0 && state.consecutive_failures >= limit {
                        // Left unfinished so a restart replays it.
                        return Err(SyncError::ExecutorUnavailable {
                            failures: state.consecutive_failures,
                            last: error,
                        });
                    }
                } else {
                    state.consecutive_failures = 0;
                }
            }
        }

        state.complete(applied.seq);
        Ok(())
    }

    /// Wait for in-flight applies within the grace period. Whatever is
    /// still running afterwards is abandoned and stays unconfirmed.
    async fn drain(&self, state: &mut RunState, tasks: &mut JoinSet<Applied>) -> error::Result<()> {
        let drained = timeout(self.config.shutdown_grace(), async {
            while let Some(joined) = tasks.join_next().await {
                self.finish(state, joined?)?;
            }
            Ok::<(), SyncError>(())
        })
        .await;

        match drained {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    abandoned = tasks.len(),
                    "Shutdown grace period elapsed with applies in flight"
                );
                Ok(())
            }
        }
    }

    fn persist(&self, state: &mut RunState) -> Result<(), CheckpointError> {
        let Some(position) = state.tracker.current() else {
            return Ok(());
        };
        if state.last_saved == Some(position) {
            return Ok(());
        }
        self.store.save(position)?;
        state.last_saved = Some(position);
        Ok(())
    }

    fn report(&self, meta: EventMeta, identity: Option<EntityIdentity>, outcome: EventOutcome) {
        if let Some(tx) = &self.reports {
            let _ = tx.send(EventReport {
                namespace: meta.namespace,
                op: meta.op,
                position: meta.position,
                identity,
                outcome,
            });
        }
    }
}

/// Apply with bounded retries. Each attempt is limited by the apply timeout;
/// a timeout counts as a retryable failure. Returns the final result and
/// the number of attempts made.
async fn apply_with_retry(
    executor: &dyn MutationExecutor,
    mutation: &Mutation,
    config: &PipelineConfig,
) -> (Result<Ack, ExecError>, u32) {
    let limit = config.apply_timeout();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match timeout(limit, executor.apply(mutation)).await {
            Ok(result) => result,
            Err(_) => Err(ExecError::Timeout(limit)),
        };

        match result {
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = config.backoff(attempt);
                tracing::warn!(
                    identity = %mutation.identity(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Apply failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            other => return (other, attempt),
        }
    }
}
