use crate::normalize::normalize_domain;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// Cache invalidation fanned out to every browsing context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Domain(String),
    /// Everything is suspect (channel lost, subscriber lagged).
    All,
}

impl Invalidation {
    pub fn domain(domain: &str) -> Self {
        Self::Domain(normalize_domain(domain))
    }

    fn concerns(&self, filter: Option<&str>) -> bool {
        match (self, filter) {
            (Self::All, _) | (_, None) => true,
            (Self::Domain(domain), Some(wanted)) => domain == wanted,
        }
    }
}

/// Fan-out of invalidations across contexts.
///
/// Only receivers are handed out; the broadcaster never holds a reference to
/// a context, so a closed tab simply drops its [`Subscription`].
#[derive(Clone)]
pub struct TabBroadcaster {
    tx: broadcast::Sender<Invalidation>,
}

impl Default for TabBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl TabBroadcaster {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribes to one domain, or to everything with `None`.
    #[must_use]
    pub fn subscribe(&self, domain: Option<&str>) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            domain: domain.map(normalize_domain),
        }
    }

    /// Returns how many subscriptions were reached.
    pub fn publish(&self, invalidation: Invalidation) -> usize {
        log::debug!("publishing {invalidation:?}");
        self.tx.send(invalidation).unwrap_or(0)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<Invalidation>,
    domain: Option<String>,
}

impl Subscription {
    /// Next invalidation for this subscription. A lagging subscriber gets
    /// [`Invalidation::All`] instead of the events it missed. `None` once the
    /// broadcaster is gone.
    pub async fn recv(&mut self) -> Option<Invalidation> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.concerns(self.domain.as_deref()) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("invalidation subscriber lagged by {missed} events");
                    return Some(Invalidation::All);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<Invalidation> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if event.concerns(self.domain.as_deref()) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => return Some(Invalidation::All),
                Err(_) => return None,
            }
        }
    }
}
