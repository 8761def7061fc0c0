use mima_core::{normalize, normalize_domain};
use mima_protocol::{unix_ms_now, Category, CredentialRecord, ErrorKind, RecordId, Secret};
use std::collections::BTreeMap;
use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Record {0} not found")]
    NotFound(RecordId),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid record: {0}")]
    Invalid(String),
}

impl StoreError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Invalid(_) => ErrorKind::MalformedMessage,
        }
    }
}

/// Field changes applied by [`AuthorityStore::update`]. `None` leaves a
/// field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub password: Option<Secret>,
    pub display_username: Option<String>,
    pub category: Option<Category>,
    pub custom_fields: Option<BTreeMap<String, String>>,
}

impl RecordUpdate {
    #[must_use]
    pub fn password(password: Secret) -> Self {
        Self {
            password: Some(password),
            ..Self::default()
        }
    }
}

/// One entry in a record's modification history. Password changes are
/// recorded without their values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub at: u64,
    pub change: String,
}

/// Durable credential storage behind the authority. Calls are serialized by
/// the authority, so implementations need no interior locking.
pub trait AuthorityStore: Send + 'static {
    /// Active records of a normalized domain. Recycle-bin entries stay
    /// with the store.
    fn lookup(&self, domain: &str) -> Vec<CredentialRecord>;

    /// Stores a new record and assigns its id and timestamps. An active
    /// record with the same key is overwritten instead (last writer wins).
    fn insert(&mut self, record: CredentialRecord) -> StoreResult<CredentialRecord>;

    fn update(&mut self, id: RecordId, update: RecordUpdate) -> StoreResult<CredentialRecord>;

    /// Moves a record to the recycle bin.
    fn soft_delete(&mut self, id: RecordId) -> StoreResult<CredentialRecord>;

    fn restore(&mut self, id: RecordId) -> StoreResult<CredentialRecord>;
}

/// In-memory store with a recycle bin and per-record history.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: BTreeMap<RecordId, CredentialRecord>,
    history: BTreeMap<RecordId, Vec<HistoryEntry>>,
    next_id: u64,
    last_ts: u64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds records as if each had been inserted in order.
    pub fn with_records(records: impl IntoIterator<Item = CredentialRecord>) -> StoreResult<Self> {
        let mut store = Self::new();
        for record in records {
            store.insert(record)?;
        }
        Ok(store)
    }

    #[must_use]
    pub fn get(&self, id: RecordId) -> Option<&CredentialRecord> {
        self.records.get(&id)
    }

    /// Deleted records, most recently updated first.
    #[must_use]
    pub fn recycle_bin(&self) -> Vec<&CredentialRecord> {
        let mut deleted: Vec<&CredentialRecord> =
            self.records.values().filter(|r| r.deleted).collect();
        deleted.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        deleted
    }

    #[must_use]
    pub fn history(&self, id: RecordId) -> &[HistoryEntry] {
        self.history.get(&id).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Unix milliseconds, strictly increasing across calls.
    fn tick(&mut self) -> u64 {
        self.last_ts = unix_ms_now().max(self.last_ts + 1);
        self.last_ts
    }

    fn note(&mut self, id: RecordId, at: u64, change: impl Into<String>) {
        self.history.entry(id).or_default().push(HistoryEntry {
            at,
            change: change.into(),
        });
    }

    fn active_with_key(&self, record: &CredentialRecord) -> Option<RecordId> {
        self.records
            .values()
            .find(|r| r.is_active() && r.canonical_key == record.canonical_key)
            .and_then(|r| r.id)
    }

    fn record_mut(&mut self, id: RecordId) -> StoreResult<&mut CredentialRecord> {
        self.records.get_mut(&id).ok_or(StoreError::NotFound(id))
    }
}

impl AuthorityStore for MemoryStore {
    fn lookup(&self, domain: &str) -> Vec<CredentialRecord> {
        let domain = normalize_domain(domain);
        self.records
            .values()
            .filter(|r| r.is_active() && r.canonical_key.domain() == domain)
            .cloned()
            .collect()
    }

    fn insert(&mut self, mut record: CredentialRecord) -> StoreResult<CredentialRecord> {
        record.domain = normalize_domain(&record.domain);
        record.display_username = record.display_username.trim().to_string();
        if record.domain.is_empty() {
            return Err(StoreError::Invalid("record has no domain".to_string()));
        }
        if record.password.is_blank() {
            return Err(StoreError::Invalid("record has a blank password".to_string()));
        }
        record.canonical_key = normalize(&record.domain, &record.display_username);

        if let Some(existing) = self.active_with_key(&record) {
            log::info!(
                "save for existing {}; overwriting {existing}",
                record.canonical_key
            );
            return self.update(
                existing,
                RecordUpdate {
                    password: Some(record.password),
                    display_username: Some(record.display_username),
                    category: Some(record.category),
                    custom_fields: Some(record.custom_fields),
                },
            );
        }

        self.next_id += 1;
        let id = RecordId(self.next_id);
        let now = self.tick();
        record.id = Some(id);
        record.created_at = now;
        record.updated_at = now;
        record.deleted = false;
        self.note(id, now, "created");
        self.records.insert(id, record.clone());
        Ok(record)
    }

    fn update(&mut self, id: RecordId, update: RecordUpdate) -> StoreResult<CredentialRecord> {
        let current = self
            .records
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))?;
        if current.deleted {
            return Err(StoreError::Conflict(format!("record {id} is in the recycle bin")));
        }
        let mut changes = Vec::new();
        let mut next = current.clone();
        if let Some(password) = update.password {
            if password.is_blank() {
                return Err(StoreError::Invalid("blank password".to_string()));
            }
            if password != next.password {
                changes.push("password changed".to_string());
                next.password = password;
            }
        }
        if let Some(username) = update.display_username {
            let username = username.trim().to_string();
            if username != next.display_username {
                changes.push(format!("username: {} -> {username}", next.display_username));
                next.display_username = username;
            }
        }
        if let Some(category) = update.category {
            if category != next.category {
                changes.push(format!("category: {} -> {category}", next.category));
                next.category = category;
            }
        }
        if let Some(fields) = update.custom_fields {
            if fields != next.custom_fields {
                changes.push("custom fields changed".to_string());
                next.custom_fields = fields;
            }
        }
        next.canonical_key = normalize(&next.domain, &next.display_username);
        if next.canonical_key != current.canonical_key && self.active_with_key(&next).is_some() {
            return Err(StoreError::Conflict(format!(
                "another active record already uses {}",
                next.canonical_key
            )));
        }

        let now = self.tick();
        next.updated_at = now;
        if changes.is_empty() {
            changes.push("saved unchanged".to_string());
        }
        for change in changes {
            self.note(id, now, change);
        }
        self.records.insert(id, next.clone());
        Ok(next)
    }

    fn soft_delete(&mut self, id: RecordId) -> StoreResult<CredentialRecord> {
        let now = self.tick();
        let record = self.record_mut(id)?;
        if record.deleted {
            return Err(StoreError::Conflict(format!("record {id} is already deleted")));
        }
        record.deleted = true;
        record.updated_at = now;
        let record = record.clone();
        self.note(id, now, "moved to recycle bin");
        Ok(record)
    }

    fn restore(&mut self, id: RecordId) -> StoreResult<CredentialRecord> {
        let candidate = self.record_mut(id)?.clone();
        if !candidate.deleted {
            return Err(StoreError::Conflict(format!("record {id} is not deleted")));
        }
        if self.active_with_key(&candidate).is_some() {
            return Err(StoreError::Conflict(format!(
                "an active record already uses {}",
                candidate.canonical_key
            )));
        }
        let now = self.tick();
        let record = self.record_mut(id)?;
        record.deleted = false;
        record.updated_at = now;
        let record = record.clone();
        self.note(id, now, "restored");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn draft(domain: &str, username: &str, password: &str) -> CredentialRecord {
        CredentialRecord {
            domain: domain.to_string(),
            display_username: username.to_string(),
            password: Secret::new(password),
            ..CredentialRecord::default()
        }
    }

    #[test]
    fn insert_assigns_id_and_normalizes() {
        let mut store = MemoryStore::new();
        let stored = store
            .insert(draft("https://www.Shop.Example/login", " Alice ", "p1"))
            .expect("insert");
        assert_eq!(stored.id, Some(RecordId(1)));
        assert_eq!(stored.domain, "shop.example");
        assert_eq!(stored.display_username, "Alice");
        assert_eq!(stored.canonical_key.username(), "alice");
        assert_eq!(store.lookup("SHOP.example").len(), 1);
    }

    #[test]
    fn timestamps_strictly_increase() {
        let mut store = MemoryStore::new();
        let a = store.insert(draft("a.example", "x", "1")).expect("insert");
        let b = store.insert(draft("b.example", "y", "2")).expect("insert");
        let a2 = store
            .update(a.id.expect("id"), RecordUpdate::password(Secret::new("3")))
            .expect("update");
        assert!(b.updated_at > a.updated_at);
        assert!(a2.updated_at > b.updated_at);
    }

    #[test]
    fn insert_over_active_key_updates_in_place() {
        let mut store = MemoryStore::new();
        store.insert(draft("shop.example", "alice", "p1")).expect("insert");
        let again = store.insert(draft("shop.example", "ALICE", "p2")).expect("insert");
        assert_eq!(again.id, Some(RecordId(1)));
        assert_eq!(again.password.expose(), "p2");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn history_never_contains_passwords() {
        let mut store = MemoryStore::new();
        let record = store.insert(draft("shop.example", "alice", "first-secret")).expect("insert");
        let id = record.id.expect("id");
        store
            .update(id, RecordUpdate::password(Secret::new("second-secret")))
            .expect("update");
        let history = store.history(id);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].change, "password changed");
        assert!(history.iter().all(|h| !h.change.contains("secret")));
    }

    #[test]
    fn deleted_records_go_to_recycle_bin_and_come_back() {
        let mut store = MemoryStore::new();
        let id = store
            .insert(draft("shop.example", "alice", "p1"))
            .expect("insert")
            .id
            .expect("id");
        store.soft_delete(id).expect("delete");
        assert_eq!(store.recycle_bin().len(), 1);
        assert!(store.lookup("shop.example").is_empty());
        assert!(matches!(
            store.update(id, RecordUpdate::password(Secret::new("p2"))),
            Err(StoreError::Conflict(_))
        ));

        let restored = store.restore(id).expect("restore");
        assert!(restored.is_active());
        assert!(store.recycle_bin().is_empty());
        assert_eq!(store.lookup("shop.example").len(), 1);
    }

    #[test]
    fn save_after_delete_creates_a_new_record() {
        let mut store = MemoryStore::new();
        let first = store.insert(draft("shop.example", "alice", "p1")).expect("insert");
        store.soft_delete(first.id.expect("id")).expect("delete");
        let second = store.insert(draft("shop.example", "alice", "p2")).expect("insert");
        assert_eq!(second.id, Some(RecordId(2)));
        assert!(matches!(
            store.restore(first.id.expect("id")),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn missing_record_is_not_found() {
        let mut store = MemoryStore::new();
        assert_eq!(
            store.soft_delete(RecordId(42)),
            Err(StoreError::NotFound(RecordId(42)))
        );
    }

    #[test]
    fn rename_onto_existing_key_conflicts() {
        let mut store = MemoryStore::new();
        store.insert(draft("shop.example", "alice", "p1")).expect("insert");
        let bob = store.insert(draft("shop.example", "bob", "q1")).expect("insert");
        let err = store
            .update(
                bob.id.expect("id"),
                RecordUpdate {
                    display_username: Some("Alice".to_string()),
                    ..RecordUpdate::default()
                },
            )
            .expect_err("conflict");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}
