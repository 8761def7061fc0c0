use crate::bridge::SyncBridge;
use crate::error::{ContextError, SyncError};
use mima_core::{
    classify, match_domain, matching_records, normalize_domain, Action, CoreError,
    CredentialCache, FormObservation, Invalidation, MatchResult, SettleWindow, Subscription,
    SyncConfig,
};
use mima_protocol::{CredentialRecord, MutateAction};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{self, Instant};

type Result<T> = std::result::Result<T, ContextError>;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Outcome of settled form submissions, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    /// A settled observation was classified.
    Classified { domain: String, action: Action },
    /// The authority stored a save or update.
    Saved {
        action: MutateAction,
        record: CredentialRecord,
    },
    /// The mutate for a classified action failed; nothing is retried.
    SaveFailed { domain: String, error: SyncError },
    /// Records for a settled observation could not be loaded. The observation
    /// stays parked until a later fill of the domain succeeds.
    Suspended { domain: String, error: SyncError },
}

enum Command {
    Autofill {
        domain: String,
        reply: oneshot::Sender<MatchResult>,
    },
    AutofillReady {
        domain: String,
        reply: oneshot::Sender<MatchResult>,
    },
    Refresh {
        domain: String,
        reply: oneshot::Sender<Result<MatchResult>>,
    },
    Observe {
        observation: FormObservation,
        reply: oneshot::Sender<std::result::Result<(), CoreError>>,
    },
}

enum Waiter {
    Ready(oneshot::Sender<MatchResult>),
    Refresh(oneshot::Sender<Result<MatchResult>>),
}

enum TaskDone {
    Filled {
        domain: String,
        result: std::result::Result<Vec<CredentialRecord>, SyncError>,
    },
    Mutated {
        domain: String,
        action: MutateAction,
        result: std::result::Result<CredentialRecord, SyncError>,
    },
}

/// One tab's view of the credential store.
///
/// All state lives in a single loop task; the handle only sends commands.
/// Dropping the handle stops the loop and aborts its outstanding fills and
/// mutates.
pub struct BrowsingContext {
    id: ContextId,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<ContextEvent>,
    task: JoinHandle<()>,
}

impl BrowsingContext {
    /// Starts the context loop. Must be called inside a tokio runtime.
    #[must_use]
    pub fn open(bridge: SyncBridge, config: &SyncConfig) -> Self {
        let id = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let invalidations = bridge.broadcaster().subscribe(None);
        let state = ContextLoop {
            id,
            cache: CredentialCache::new(config.cache_capacity()),
            settle: SettleWindow::new(config.settle_window()),
            bridge,
            tasks: JoinSet::new(),
            waiters: HashMap::new(),
            parked: HashMap::new(),
            events: event_tx,
        };
        log::debug!("{id} opened");
        let task = tokio::spawn(state.run(command_rx, invalidations));
        Self {
            id,
            commands,
            events,
            task,
        }
    }

    #[must_use]
    pub const fn id(&self) -> ContextId {
        self.id
    }

    /// Answers from the cache without waiting. A cold or stale domain
    /// answers `None` and starts loading in the background.
    pub async fn autofill(&self, domain: &str) -> Result<MatchResult> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Autofill {
            domain: domain.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| ContextError::Closed)
    }

    /// Like [`BrowsingContext::autofill`], but waits for a pending load.
    /// A failed load answers `None`.
    pub async fn autofill_ready(&self, domain: &str) -> Result<MatchResult> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AutofillReady {
            domain: domain.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| ContextError::Closed)
    }

    /// Reloads a domain from the authority and reports why it failed.
    pub async fn refresh(&self, domain: &str) -> Result<MatchResult> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Refresh {
            domain: domain.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| ContextError::Closed)?
    }

    /// Feeds a form submission into the settle window. Invalid observations
    /// are rejected here and never classified.
    pub async fn observe(&self, observation: FormObservation) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Observe { observation, reply })?;
        rx.await.map_err(|_| ContextError::Closed)?.map_err(Into::into)
    }

    pub async fn next_event(&mut self) -> Option<ContextEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<ContextEvent> {
        self.events.try_recv().ok()
    }

    /// Stops the loop and waits until it is gone.
    pub async fn close(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        log::debug!("{} closed", self.id);
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| ContextError::Closed)
    }
}

impl Drop for BrowsingContext {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct ContextLoop {
    id: ContextId,
    bridge: SyncBridge,
    cache: CredentialCache,
    settle: SettleWindow,
    tasks: JoinSet<TaskDone>,
    waiters: HashMap<String, Vec<Waiter>>,
    /// Settled observations waiting for their domain's records.
    parked: HashMap<String, FormObservation>,
    events: mpsc::UnboundedSender<ContextEvent>,
}

impl ContextLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut invalidations: Subscription,
    ) {
        loop {
            let next_deadline = self.settle.next_deadline();

            tokio::select! {
                biased;

                Some(invalidation) = invalidations.recv() => self.on_invalidation(invalidation),
                Some(done) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.on_task_done(done);
                }
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                () = async {
                    if let Some(deadline) = next_deadline {
                        time::sleep_until(deadline).await;
                    }
                }, if next_deadline.is_some() => self.on_settle_timer(),
            }
        }
        log::debug!("{} loop finished", self.id);
    }

    fn on_invalidation(&mut self, invalidation: Invalidation) {
        match invalidation {
            Invalidation::Domain(domain) => self.cache.invalidate(&domain),
            Invalidation::All => self.cache.invalidate_all(),
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Autofill { domain, reply } => {
                let domain = normalize_domain(&domain);
                let result = if domain.is_empty() {
                    MatchResult::None
                } else {
                    self.ensure_fill(&domain);
                    match_domain(&self.cache, &domain)
                };
                let _ = reply.send(result);
            }
            Command::AutofillReady { domain, reply } => {
                let domain = normalize_domain(&domain);
                if domain.is_empty() {
                    let _ = reply.send(MatchResult::None);
                } else if self.ensure_fill(&domain) {
                    let _ = reply.send(match_domain(&self.cache, &domain));
                } else {
                    self.waiters.entry(domain).or_default().push(Waiter::Ready(reply));
                }
            }
            Command::Refresh { domain, reply } => {
                let domain = normalize_domain(&domain);
                if domain.is_empty() {
                    let _ = reply.send(Ok(MatchResult::None));
                    return;
                }
                if !self.cache.is_in_flight(&domain) {
                    self.cache.invalidate(&domain);
                }
                self.ensure_fill(&domain);
                self.waiters
                    .entry(domain)
                    .or_default()
                    .push(Waiter::Refresh(reply));
            }
            Command::Observe { observation, reply } => {
                let domain = observation.normalized_domain();
                let result = self
                    .settle
                    .observe(observation, Instant::now())
                    .map(|replaced| {
                        if replaced {
                            log::debug!("{} superseded a pending submission on {domain}", self.id);
                        }
                    });
                let _ = reply.send(result);
            }
        }
    }

    fn on_settle_timer(&mut self) {
        for observation in self.settle.take_settled(Instant::now()) {
            self.decide(observation);
        }
    }

    fn on_task_done(&mut self, done: std::result::Result<TaskDone, JoinError>) {
        match done {
            Ok(TaskDone::Filled { domain, result }) => self.on_filled(domain, result),
            Ok(TaskDone::Mutated {
                domain,
                action,
                result,
            }) => match result {
                Ok(record) => {
                    log::info!("{} {action} stored for {domain}", self.id);
                    self.emit(ContextEvent::Saved { action, record });
                }
                Err(error) => {
                    log::warn!("{} {action} for {domain} failed: {error}", self.id);
                    self.emit(ContextEvent::SaveFailed { domain, error });
                }
            },
            Err(err) => log::error!("{} background task failed: {err}", self.id),
        }
    }

    fn on_filled(
        &mut self,
        domain: String,
        result: std::result::Result<Vec<CredentialRecord>, SyncError>,
    ) {
        match result {
            Ok(records) => {
                if !self.cache.put(&domain, records) {
                    // Raced an invalidation: load again if anyone is waiting.
                    if self.waiters.contains_key(&domain) || self.parked.contains_key(&domain) {
                        self.ensure_fill(&domain);
                    }
                    return;
                }
                let result = match_domain(&self.cache, &domain);
                for waiter in self.waiters.remove(&domain).unwrap_or_default() {
                    match waiter {
                        Waiter::Ready(reply) => {
                            let _ = reply.send(result.clone());
                        }
                        Waiter::Refresh(reply) => {
                            let _ = reply.send(Ok(result.clone()));
                        }
                    }
                }
                if let Some(observation) = self.parked.remove(&domain) {
                    self.decide(observation);
                }
            }
            Err(error) => {
                self.cache.fill_failed(&domain);
                log::warn!("{} loading {domain} failed: {error}", self.id);
                for waiter in self.waiters.remove(&domain).unwrap_or_default() {
                    match waiter {
                        Waiter::Ready(reply) => {
                            let _ = reply.send(MatchResult::None);
                        }
                        Waiter::Refresh(reply) => {
                            let _ = reply.send(Err(error.clone().into()));
                        }
                    }
                }
                if self.parked.contains_key(&domain) {
                    self.emit(ContextEvent::Suspended { domain, error });
                }
            }
        }
    }

    /// Classifies a settled observation against fresh records, or parks it
    /// until they are loaded.
    fn decide(&mut self, observation: FormObservation) {
        let domain = observation.normalized_domain();
        let lookup = self.cache.get(&domain);
        let start_fill = lookup.start_fill;
        let decision = lookup.fresh().map(|entry| {
            let matches: Vec<CredentialRecord> = matching_records(&observation, entry.records())
                .into_iter()
                .cloned()
                .collect();
            (classify(&observation, &matches), matches)
        });
        if start_fill {
            self.spawn_fill(domain.clone());
        }

        match decision {
            None => {
                log::debug!("{} waiting for records of {domain}", self.id);
                self.parked.insert(domain, observation);
            }
            Some((Ok(action), matches)) => {
                let mutation = action.mutation(&matches);
                self.emit(ContextEvent::Classified {
                    domain: domain.clone(),
                    action,
                });
                if let Some(mutation) = mutation {
                    // Later submissions must see the authority's answer.
                    self.cache.invalidate(&domain);
                    self.spawn_mutate(domain, mutation.action, mutation.record);
                }
            }
            Some((Err(err), _)) => {
                log::warn!("{} discarding submission for {domain}: {err}", self.id);
            }
        }
    }

    /// Returns whether the domain is fresh; starts a fill when it is not and
    /// none is running.
    fn ensure_fill(&mut self, domain: &str) -> bool {
        let lookup = self.cache.get(domain);
        let fresh = lookup.fresh().is_some();
        let start_fill = lookup.start_fill;
        if start_fill {
            self.spawn_fill(domain.to_string());
        }
        fresh
    }

    fn spawn_fill(&mut self, domain: String) {
        log::debug!("{} loading {domain}", self.id);
        let bridge = self.bridge.clone();
        self.tasks.spawn(async move {
            let result = bridge.query(&domain).await;
            TaskDone::Filled { domain, result }
        });
    }

    fn spawn_mutate(&mut self, domain: String, action: MutateAction, record: CredentialRecord) {
        let bridge = self.bridge.clone();
        self.tasks.spawn(async move {
            let result = bridge.mutate(action, record).await;
            TaskDone::Mutated {
                domain,
                action,
                result,
            }
        });
    }

    fn emit(&self, event: ContextEvent) {
        // The handle may already be gone.
        let _ = self.events.send(event);
    }
}
