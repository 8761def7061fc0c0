use crate::store::{AuthorityStore, RecordUpdate, StoreError, StoreResult};
use mima_core::normalize_domain;
use mima_protocol::{
    read_frame, write_frame, CredentialRecord, ErrorKind, MutateAction, ProtocolError, RecordId,
    SyncMessage,
};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const PEER_CHANNEL_CAPACITY: usize = 256;
const INBOUND_QUEUE: usize = 32;

/// A domain changed; `origin` is the connection that caused it, if any.
#[derive(Debug, Clone)]
struct PeerEvent {
    domain: String,
    origin: Option<u64>,
}

/// Reference authority: owns the store and answers browser connections.
///
/// Store access is serialized behind a mutex. Every change is pushed as an
/// `invalidate` to each connection except the one that made it, which learns
/// about it from its own reply.
pub struct Authority<S> {
    store: Arc<Mutex<S>>,
    peers: broadcast::Sender<PeerEvent>,
    next_connection: Arc<AtomicU64>,
}

impl<S> Clone for Authority<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            peers: self.peers.clone(),
            next_connection: Arc::clone(&self.next_connection),
        }
    }
}

impl<S: AuthorityStore> Authority<S> {
    pub fn new(store: S) -> Self {
        let (peers, _) = broadcast::channel(PEER_CHANNEL_CAPACITY);
        Self {
            store: Arc::new(Mutex::new(store)),
            peers,
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    fn store(&self) -> MutexGuard<'_, S> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` against the store, e.g. to inspect it.
    pub fn with_store<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.store())
    }

    /// Number of browser connections currently served.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.peers.receiver_count()
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(&self, listener: UnixListener) -> io::Result<()> {
        loop {
            let (stream, _) = listener.accept().await?;
            let (read, write) = tokio::io::split(stream);
            self.spawn_connection(read, write);
        }
    }

    /// Serves one already-established byte stream.
    pub fn spawn_connection<R, W>(&self, reader: R, writer: W) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        // Subscribe before spawning so no change between accept and the first
        // poll is missed.
        let peers = self.peers.subscribe();
        let authority = self.clone();
        tokio::spawn(async move {
            log::debug!("conn {id}: accepted");
            authority.run_connection(id, reader, writer, peers).await;
            log::debug!("conn {id}: closed");
        })
    }

    /// Tells every connection that a domain changed outside of a mutate,
    /// e.g. through the desktop interface.
    pub fn notify_changed(&self, domain: &str) {
        self.publish(normalize_domain(domain), None);
    }

    /// Adds a record from the desktop interface.
    pub fn insert(&self, record: CredentialRecord) -> StoreResult<CredentialRecord> {
        let stored = self.store().insert(record)?;
        self.notify_changed(stored.canonical_key.domain());
        Ok(stored)
    }

    /// Moves a record to the recycle bin and tells every connection.
    pub fn soft_delete(&self, id: RecordId) -> StoreResult<CredentialRecord> {
        let record = self.store().soft_delete(id)?;
        log::info!("{} moved to recycle bin", record.canonical_key);
        self.notify_changed(record.canonical_key.domain());
        Ok(record)
    }

    pub fn restore(&self, id: RecordId) -> StoreResult<CredentialRecord> {
        let record = self.store().restore(id)?;
        log::info!("{} restored", record.canonical_key);
        self.notify_changed(record.canonical_key.domain());
        Ok(record)
    }

    fn publish(&self, domain: String, origin: Option<u64>) {
        // No receivers just means nobody is connected.
        let _ = self.peers.send(PeerEvent { domain, origin });
    }

    async fn run_connection<R, W>(
        &self,
        id: u64,
        mut reader: R,
        mut writer: W,
        mut peers: broadcast::Receiver<PeerEvent>,
    ) where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        // Frame reads are not cancel-safe, so they get their own task.
        let (frames_tx, mut frames) = mpsc::channel(INBOUND_QUEUE);
        let read_task = tokio::spawn(async move {
            loop {
                let frame = read_frame(&mut reader).await;
                let last = !matches!(frame, Ok(Some(_)));
                if frames_tx.send(frame).await.is_err() || last {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(Ok(Some(message))) => {
                        let Some(reply) = self.handle(id, message) else {
                            continue;
                        };
                        if let Err(err) = write_frame(&mut writer, &reply).await {
                            log::warn!("conn {id}: write failed: {err}");
                            break;
                        }
                    }
                    Some(Ok(None)) | None => break,
                    Some(Err(err)) => {
                        log::warn!("conn {id}: dropping connection: {err}");
                        if !matches!(err, ProtocolError::Io(_)) {
                            let notice = SyncMessage::error(0, "", err.kind(), err.to_string());
                            let _ = write_frame(&mut writer, &notice).await;
                        }
                        break;
                    }
                },
                event = peers.recv() => {
                    let notice = match event {
                        Ok(PeerEvent { origin, .. }) if origin == Some(id) => continue,
                        Ok(PeerEvent { domain, .. }) => SyncMessage::invalidate(domain),
                        // Missed changes: an empty domain invalidates everything.
                        Err(broadcast::error::RecvError::Lagged(_)) => SyncMessage::invalidate(""),
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    if let Err(err) = write_frame(&mut writer, &notice).await {
                        log::warn!("conn {id}: write failed: {err}");
                        break;
                    }
                }
            }
        }
        read_task.abort();
    }

    fn handle(&self, connection: u64, message: SyncMessage) -> Option<SyncMessage> {
        match message {
            SyncMessage::Query {
                correlation_id,
                domain,
            } => {
                let domain = normalize_domain(&domain);
                let records = self.store().lookup(&domain);
                log::debug!(
                    "conn {connection}: query {domain} -> {} records",
                    records.len()
                );
                Some(SyncMessage::QueryResult {
                    correlation_id,
                    domain,
                    records,
                })
            }
            SyncMessage::Mutate {
                correlation_id,
                domain,
                action,
                record,
            } => Some(match self.apply(action, record) {
                Ok(stored) => {
                    let domain = stored.canonical_key.domain().to_string();
                    log::info!("conn {connection}: {action} {}", stored.canonical_key);
                    self.publish(domain.clone(), Some(connection));
                    SyncMessage::MutateResult {
                        correlation_id,
                        domain,
                        record: stored,
                    }
                }
                Err(err) => {
                    log::warn!("conn {connection}: {action} on {domain} rejected: {err}");
                    SyncMessage::error(correlation_id, domain, mutate_error_kind(&err), err.to_string())
                }
            }),
            SyncMessage::Error { kind, message, .. } => {
                log::warn!("conn {connection}: client reported {kind}: {message}");
                None
            }
            other => Some(SyncMessage::error(
                other.correlation_id(),
                other.domain(),
                ErrorKind::MalformedMessage,
                format!("unexpected {} from a client", other.type_name()),
            )),
        }
    }

    fn apply(&self, action: MutateAction, record: CredentialRecord) -> StoreResult<CredentialRecord> {
        let mut store = self.store();
        match action {
            MutateAction::SaveNew => store.insert(record),
            MutateAction::UpdatePassword => {
                let id = record
                    .id
                    .ok_or_else(|| StoreError::Invalid("update without a record id".to_string()))?;
                store.update(id, RecordUpdate::password(record.password))
            }
        }
    }
}

/// An update whose target vanished is a conflict from the browser's view.
fn mutate_error_kind(err: &StoreError) -> ErrorKind {
    match err {
        StoreError::NotFound(_) => ErrorKind::Conflict,
        other => other.kind(),
    }
}

/// Binds the authority socket, replacing a stale socket file. Fails with
/// `AddrInUse` when another authority is already answering on it.
pub async fn bind_socket(path: &Path) -> io::Result<UnixListener> {
    if UnixStream::connect(path).await.is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("an authority is already listening on {}", path.display()),
        ));
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => log::debug!("removed stale socket {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    UnixListener::bind(path)
}
