use crate::error::Result;
use crate::observation::FormObservation;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

struct PendingObservation {
    observation: FormObservation,
    deadline: Instant,
}

/// Debounces form submissions per domain.
///
/// Each observation re-arms its domain's timer and replaces the pending
/// value; an observation is released exactly once, when its timer expires
/// without another reset.
pub struct SettleWindow {
    window: Duration,
    pending: HashMap<String, PendingObservation>,
}

impl SettleWindow {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Arms (or re-arms) the timer for the observation's domain. Returns
    /// `true` when an earlier pending observation was superseded.
    pub fn observe(&mut self, observation: FormObservation, now: Instant) -> Result<bool> {
        observation.validate()?;
        let domain = observation.normalized_domain();
        let replaced = self
            .pending
            .insert(
                domain,
                PendingObservation {
                    observation,
                    deadline: now + self.window,
                },
            )
            .is_some();
        Ok(replaced)
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Removes and returns every observation whose timer has expired, oldest
    /// deadline first.
    pub fn take_settled(&mut self, now: Instant) -> Vec<FormObservation> {
        let mut due: Vec<(Instant, String)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(domain, p)| (p.deadline, domain.clone()))
            .collect();
        due.sort();
        due.into_iter()
            .filter_map(|(_, domain)| self.pending.remove(&domain))
            .map(|p| p.observation)
            .collect()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
