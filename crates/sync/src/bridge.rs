use crate::connector::{BoxedReader, BoxedWriter, Connector};
use crate::error::{Result, SyncError};
use mima_core::{normalize_domain, Invalidation, SyncConfig, TabBroadcaster};
use mima_protocol::{encode_frame, read_frame, CredentialRecord, MutateAction, SyncMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type Reply = std::result::Result<SyncMessage, SyncError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One live connection to the authority.
struct Link {
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    closed: AtomicBool,
    last_activity: Mutex<Instant>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    fn spawn(reader: BoxedReader, writer: BoxedWriter, broadcaster: TabBroadcaster) -> Arc<Self> {
        let link = Arc::new(Self {
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            reader: Mutex::new(None),
        });
        let handle = tokio::spawn(read_loop(reader, Arc::clone(&link), broadcaster));
        *lock(&link.reader) = Some(handle);
        link
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    /// Registers a waiter. Fails when the link was torn down concurrently.
    fn register(&self, id: u64, tx: oneshot::Sender<Reply>) -> Result<()> {
        let mut pending = lock(&self.pending);
        if self.is_closed() {
            return Err(SyncError::ChannelClosed);
        }
        pending.insert(id, tx);
        Ok(())
    }

    fn release(&self, id: u64) {
        lock(&self.pending).remove(&id);
    }

    fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    async fn send(&self, frame: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await
    }

    fn dispatch(&self, message: SyncMessage, broadcaster: &TabBroadcaster) {
        if let SyncMessage::Invalidate { domain, .. } = &message {
            let invalidation = if domain.trim().is_empty() {
                Invalidation::All
            } else {
                Invalidation::domain(domain)
            };
            broadcaster.publish(invalidation);
            return;
        }

        let id = message.correlation_id();
        let waiter = lock(&self.pending).remove(&id);
        match waiter {
            Some(tx) => {
                // The requester may have given up already.
                let _ = tx.send(Ok(message));
            }
            None if matches!(message, SyncMessage::Error { .. }) => {
                log::warn!("authority error without a waiter (correlation id {id})");
            }
            None => log::debug!(
                "dropping late {} for correlation id {id}",
                message.type_name()
            ),
        }
    }

    /// Fails every pending request and tells all contexts their caches are
    /// suspect. Runs once per link.
    fn tear_down(&self, broadcaster: &TabBroadcaster) {
        let drained: Vec<oneshot::Sender<Reply>> = {
            let mut pending = lock(&self.pending);
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            pending.drain().map(|(_, tx)| tx).collect()
        };
        // Caches go stale before any caller learns of the failure.
        broadcaster.publish(Invalidation::All);
        if !drained.is_empty() {
            log::warn!("failing {} pending authority requests", drained.len());
        }
        for tx in drained {
            let _ = tx.send(Err(SyncError::ChannelClosed));
        }
    }

    fn abort_reader(&self) {
        if let Some(handle) = lock(&self.reader).take() {
            handle.abort();
        }
    }
}

async fn read_loop(mut reader: BoxedReader, link: Arc<Link>, broadcaster: TabBroadcaster) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(message)) => {
                link.touch();
                link.dispatch(message, &broadcaster);
            }
            Ok(None) => {
                log::info!("authority closed the channel");
                break;
            }
            Err(err) => {
                log::warn!("dropping authority channel: {err}");
                break;
            }
        }
    }
    link.tear_down(&broadcaster);
}

/// Removes the pending slot when the request finishes or its future is
/// dropped.
struct PendingGuard<'a> {
    link: &'a Link,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.link.release(self.id);
    }
}

struct Inner {
    connector: Box<dyn Connector>,
    query_timeout: Duration,
    broadcaster: TabBroadcaster,
    link: Mutex<Option<Arc<Link>>>,
    connecting: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(link) = lock(&self.link).take() {
            link.abort_reader();
        }
    }
}

/// Request/response channel to the authority, shared by every browsing
/// context of a process.
///
/// The connection is opened on first use and reopened after it is lost.
/// Every reply is matched to its request by correlation id; ids start at 1
/// and only grow.
#[derive(Clone)]
pub struct SyncBridge {
    inner: Arc<Inner>,
}

impl SyncBridge {
    pub fn new(
        connector: impl Connector,
        broadcaster: TabBroadcaster,
        query_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector: Box::new(connector),
                query_timeout,
                broadcaster,
                link: Mutex::new(None),
                connecting: tokio::sync::Mutex::new(()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn from_config(
        connector: impl Connector,
        broadcaster: TabBroadcaster,
        config: &SyncConfig,
    ) -> Self {
        Self::new(connector, broadcaster, config.query_timeout())
    }

    #[must_use]
    pub fn broadcaster(&self) -> &TabBroadcaster {
        &self.inner.broadcaster
    }

    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        self.inner.query_timeout
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.current_link().is_some()
    }

    /// Requests awaiting a reply on the current link.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.current_link().map_or(0, |link| link.pending_len())
    }

    /// Every record the authority holds for a domain.
    pub async fn query(&self, domain: &str) -> Result<Vec<CredentialRecord>> {
        let domain = normalize_domain(domain);
        let reply = self
            .request("query_result", |correlation_id| SyncMessage::Query {
                correlation_id,
                domain: domain.clone(),
            })
            .await?;
        match reply {
            SyncMessage::QueryResult { records, .. } => Ok(records),
            other => Err(unexpected_reply("query_result", &other)),
        }
    }

    /// Applies a mutation and returns the record as stored. Every context
    /// sees the domain invalidated before this returns.
    pub async fn mutate(
        &self,
        action: MutateAction,
        record: CredentialRecord,
    ) -> Result<CredentialRecord> {
        let domain = normalize_domain(&record.domain);
        let reply = self
            .request("mutate_result", |correlation_id| SyncMessage::Mutate {
                correlation_id,
                domain: domain.clone(),
                action,
                record,
            })
            .await?;
        match reply {
            SyncMessage::MutateResult { record, .. } => {
                log::debug!("{action} stored {} for {domain}", record.canonical_key);
                self.inner.broadcaster.publish(Invalidation::domain(&domain));
                Ok(record)
            }
            other => Err(unexpected_reply("mutate_result", &other)),
        }
    }

    /// Sends one request and waits for its reply. An `error` reply becomes
    /// the matching `SyncError`; any reply type other than `expected` drops
    /// the link.
    async fn request(
        &self,
        expected: &'static str,
        build: impl FnOnce(u64) -> SyncMessage,
    ) -> Result<SyncMessage> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let message = build(id);
        // Oversized requests are refused before any connection is opened.
        let frame = encode_frame(&message)?;
        let link = self.link().await?;

        let (tx, rx) = oneshot::channel();
        link.register(id, tx)?;
        let _guard = PendingGuard { link: &link, id };

        if let Err(err) = link.send(&frame).await {
            log::warn!("write to authority failed: {err}");
            self.drop_link(&link);
            return Err(SyncError::ChannelClosed);
        }
        match self.await_reply(&link, rx).await? {
            SyncMessage::Error { kind, message, .. } => Err(SyncError::from_remote(kind, message)),
            reply if reply.type_name() == expected => Ok(reply),
            other => {
                let err = unexpected_reply(expected, &other);
                log::warn!("dropping authority channel: {err}");
                self.drop_link(&link);
                Err(err)
            }
        }
    }

    fn drop_link(&self, link: &Link) {
        link.tear_down(&self.inner.broadcaster);
        link.abort_reader();
    }

    /// Waits until the reply arrives or the link stays silent for the full
    /// query timeout.
    async fn await_reply(&self, link: &Link, mut rx: oneshot::Receiver<Reply>) -> Result<SyncMessage> {
        let timeout = self.inner.query_timeout;
        let mut deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, &mut rx).await {
                Ok(Ok(reply)) => return reply,
                Ok(Err(_)) => return Err(SyncError::ChannelClosed),
                Err(_) => {
                    let extended = link.last_activity() + timeout;
                    if extended > deadline {
                        deadline = extended;
                        continue;
                    }
                    return Err(SyncError::Timeout(timeout));
                }
            }
        }
    }

    fn current_link(&self) -> Option<Arc<Link>> {
        lock(&self.inner.link)
            .as_ref()
            .filter(|link| !link.is_closed())
            .cloned()
    }

    async fn link(&self) -> Result<Arc<Link>> {
        if let Some(link) = self.current_link() {
            return Ok(link);
        }
        let _connecting = self.inner.connecting.lock().await;
        if let Some(link) = self.current_link() {
            return Ok(link);
        }

        let target = self.inner.connector.describe();
        let (reader, writer) = self.inner.connector.connect().await.map_err(|err| {
            log::debug!("authority at {target} unavailable: {err}");
            SyncError::AuthorityUnavailable(format!("{target}: {err}"))
        })?;
        log::info!("connected to authority at {target}");

        let link = Link::spawn(reader, writer, self.inner.broadcaster.clone());
        if let Some(old) = lock(&self.inner.link).replace(Arc::clone(&link)) {
            old.abort_reader();
        }
        Ok(link)
    }
}

fn unexpected_reply(expected: &str, reply: &SyncMessage) -> SyncError {
    SyncError::MalformedMessage(format!("expected {expected}, got {}", reply.type_name()))
}
