use crate::normalize::{normalize, normalize_domain};
use lru::LruCache;
use mima_protocol::{CanonicalKey, CredentialRecord};
use std::collections::HashMap;
use std::num::NonZeroUsize;

/// Known credentials for one domain.
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    records: Vec<CredentialRecord>,
    by_key: HashMap<CanonicalKey, usize>,
    fresh: bool,
}

impl CacheEntry {
    fn from_records(records: Vec<CredentialRecord>) -> Self {
        let mut kept: Vec<CredentialRecord> = Vec::with_capacity(records.len());
        let mut by_key = HashMap::with_capacity(records.len());
        for mut record in records.into_iter().filter(CredentialRecord::is_active) {
            record.canonical_key = normalize(&record.domain, &record.display_username);
            match by_key.get(&record.canonical_key) {
                // One active record per key: keep the most recently updated.
                Some(&idx) => {
                    let existing: &mut CredentialRecord = &mut kept[idx];
                    if record.updated_at > existing.updated_at {
                        log::warn!(
                            "duplicate active record for {}; keeping the newer one",
                            record.canonical_key
                        );
                        *existing = record;
                    }
                }
                None => {
                    by_key.insert(record.canonical_key.clone(), kept.len());
                    kept.push(record);
                }
            }
        }
        Self {
            records: kept,
            by_key,
            fresh: true,
        }
    }

    #[must_use]
    pub fn records(&self) -> &[CredentialRecord] {
        &self.records
    }

    /// Exact lookup by canonical key.
    #[must_use]
    pub fn find(&self, key: &CanonicalKey) -> Option<&CredentialRecord> {
        self.by_key.get(key).map(|&idx| &self.records[idx])
    }

    #[must_use]
    pub const fn is_fresh(&self) -> bool {
        self.fresh
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Result of [`CredentialCache::get`].
#[derive(Debug)]
pub struct CacheLookup<'a> {
    /// Present even when stale; callers must check [`CacheLookup::fresh`].
    pub entry: Option<&'a CacheEntry>,
    /// The caller owns the single outstanding fill for this domain and must
    /// finish it with [`CredentialCache::put`] or [`CredentialCache::fill_failed`].
    pub start_fill: bool,
}

impl CacheLookup<'_> {
    /// Entry usable for decisions, if any.
    #[must_use]
    pub fn fresh(&self) -> Option<&CacheEntry> {
        self.entry.filter(|entry| entry.is_fresh())
    }
}

/// Per-context cache of credential summaries, keyed by normalized domain.
pub struct CredentialCache {
    entries: LruCache<String, CacheEntry>,
    /// Domains with an outstanding fill. `true` once an invalidation raced
    /// the fill, so its result must not be trusted as fresh.
    in_flight: HashMap<String, bool>,
}

impl CredentialCache {
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            in_flight: HashMap::new(),
        }
    }

    /// Reads a domain. A cold or stale domain hands out exactly one fill
    /// ticket until that fill completes.
    pub fn get(&mut self, domain: &str) -> CacheLookup<'_> {
        let domain = normalize_domain(domain);
        let fresh = self.entries.get(&domain).is_some_and(CacheEntry::is_fresh);
        let start_fill = if !fresh && !self.in_flight.contains_key(&domain) {
            self.in_flight.insert(domain.clone(), false);
            true
        } else {
            false
        };
        CacheLookup {
            entry: self.entries.peek(&domain),
            start_fill,
        }
    }

    /// Replaces everything known for a domain. Returns whether the entry is
    /// fresh afterwards.
    pub fn put(&mut self, domain: &str, records: Vec<CredentialRecord>) -> bool {
        let domain = normalize_domain(domain);
        let tainted = self.in_flight.remove(&domain).unwrap_or(false);
        let mut entry = CacheEntry::from_records(records);
        entry.fresh = !tainted;
        if tainted {
            log::debug!("fill for {domain} raced an invalidation; keeping it stale");
        }
        if let Some((evicted, _)) = self.entries.push(domain.clone(), entry) {
            if evicted != domain {
                log::debug!("evicted cold cache entry {evicted}");
            }
        }
        !tainted
    }

    /// Releases the fill slot without caching a negative result.
    pub fn fill_failed(&mut self, domain: &str) {
        self.in_flight.remove(&normalize_domain(domain));
    }

    /// Marks a domain stale. Records stay until the refill replaces them.
    pub fn invalidate(&mut self, domain: &str) {
        let domain = normalize_domain(domain);
        if let Some(entry) = self.entries.peek_mut(&domain) {
            entry.fresh = false;
        }
        if let Some(tainted) = self.in_flight.get_mut(&domain) {
            *tainted = true;
        }
    }

    pub fn invalidate_all(&mut self) {
        for (_, entry) in self.entries.iter_mut() {
            entry.fresh = false;
        }
        for tainted in self.in_flight.values_mut() {
            *tainted = true;
        }
    }

    /// Reads without touching recency or fill state.
    #[must_use]
    pub fn peek(&self, domain: &str) -> Option<&CacheEntry> {
        self.entries.peek(&normalize_domain(domain))
    }

    #[must_use]
    pub fn is_fresh(&self, domain: &str) -> bool {
        self.entries
            .peek(&normalize_domain(domain))
            .is_some_and(CacheEntry::is_fresh)
    }

    #[must_use]
    pub fn is_in_flight(&self, domain: &str) -> bool {
        self.in_flight.contains_key(&normalize_domain(domain))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
