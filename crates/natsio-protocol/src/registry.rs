//! Subscription registry: identifier allocation, per-subscription counters,
//! auto-unsubscribe limits, timeout bookkeeping and local fan-out.
//!
//! The registry is generic over the callback handle `C` so the same code
//! serves the client (application callbacks) and servers that route
//! messages to connections.

use crate::error::{NatsError, Result};
use crate::subject::{matches, validate_pattern, validate_queue_group};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An armed per-subscription timeout. `timer_id` identifies the timer task
/// so a stale firing can be recognised and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimeout {
    pub expected: u64,
    pub deadline: Instant,
    pub timer_id: u64,
}

#[derive(Debug, Clone)]
pub struct Subscription<C> {
    pub sid: SubscriptionId,
    pub subject: String,
    pub queue: Option<String>,
    pub callback: C,
    pub received: u64,
    pub max: Option<u64>,
    pub timeout: Option<ArmedTimeout>,
    pub draining: bool,
}

impl<C> Subscription<C> {
    /// Messages still allowed before the auto-unsubscribe limit, if any.
    #[must_use]
    pub fn remaining(&self) -> Option<u64> {
        self.max.map(|max| max.saturating_sub(self.received))
    }
}

/// Result of an unsubscribe request.
#[derive(Debug)]
pub enum Unsubscribe<C> {
    /// Removed now; the subscription is returned so its timer can be cleared.
    Removed(Subscription<C>),
    /// Removal deferred until `max` total messages have been delivered.
    Deferred { max: u64, remaining: u64 },
    /// Unknown or already removed id.
    Unknown,
}

/// Outcome of delivering one message to a subscription.
#[derive(Debug, Clone)]
pub struct Delivery<C> {
    pub sid: SubscriptionId,
    pub callback: C,
    /// The delivery reached the auto-unsubscribe limit and removed the entry.
    pub removed: bool,
    /// Timeout cleared because the expected count arrived.
    pub cleared_timeout: Option<ArmedTimeout>,
}

/// What to send to a freshly connected server to restore a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayEntry {
    pub sid: SubscriptionId,
    pub subject: String,
    pub queue: Option<String>,
    /// Remaining messages to request via `UNSUB sid n`, if limited.
    pub remaining: Option<u64>,
}

#[derive(Debug)]
pub struct SubscriptionRegistry<C> {
    subs: BTreeMap<u64, Subscription<C>>,
    next_sid: u64,
    next_timer_id: u64,
    draining: bool,
    closed: bool,
}

impl<C> Default for SubscriptionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> SubscriptionRegistry<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subs: BTreeMap::new(),
            next_sid: 1,
            next_timer_id: 1,
            draining: false,
            closed: false,
        }
    }

    fn admit(&self) -> Result<()> {
        if self.closed {
            return Err(NatsError::ConnectionClosed);
        }
        if self.draining {
            return Err(NatsError::ConnectionDraining);
        }
        Ok(())
    }

    pub fn subscribe(
        &mut self,
        subject: &str,
        queue: Option<&str>,
        callback: C,
    ) -> Result<SubscriptionId> {
        self.admit()?;
        validate_pattern(subject)?;
        if let Some(queue) = queue {
            validate_queue_group(queue)?;
        }

        let sid = SubscriptionId(self.next_sid);
        self.next_sid += 1;
        self.subs.insert(
            sid.0,
            Subscription {
                sid,
                subject: subject.to_string(),
                queue: queue.map(str::to_string),
                callback,
                received: 0,
                max: None,
                timeout: None,
                draining: false,
            },
        );
        Ok(sid)
    }

    /// Removes a subscription now, or after `after` total deliveries.
    pub fn unsubscribe(&mut self, sid: SubscriptionId, after: Option<u64>) -> Unsubscribe<C> {
        let Some(sub) = self.subs.get_mut(&sid.0) else {
            return Unsubscribe::Unknown;
        };
        match after {
            Some(max) if sub.received < max => {
                sub.max = Some(max);
                Unsubscribe::Deferred {
                    max,
                    remaining: max - sub.received,
                }
            }
            _ => match self.subs.remove(&sid.0) {
                Some(sub) => Unsubscribe::Removed(sub),
                None => Unsubscribe::Unknown,
            },
        }
    }

    pub fn remove(&mut self, sid: SubscriptionId) -> Option<Subscription<C>> {
        self.subs.remove(&sid.0)
    }

    #[must_use]
    pub fn get(&self, sid: SubscriptionId) -> Option<&Subscription<C>> {
        self.subs.get(&sid.0)
    }

    #[must_use]
    pub fn contains(&self, sid: SubscriptionId) -> bool {
        self.subs.contains_key(&sid.0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription<C>> {
        self.subs.values()
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Arms a timeout that fires unless `expected` messages arrive within
    /// `after`. Returns the new timer and any timer it replaced.
    pub fn set_timeout(
        &mut self,
        sid: SubscriptionId,
        after: Duration,
        expected: u64,
        now: Instant,
    ) -> Result<(ArmedTimeout, Option<ArmedTimeout>)> {
        let timer_id = self.next_timer_id;
        let sub = self
            .subs
            .get_mut(&sid.0)
            .ok_or(NatsError::UnknownSubscription(sid.0))?;
        self.next_timer_id += 1;
        let armed = ArmedTimeout {
            expected,
            deadline: now + after,
            timer_id,
        };
        let replaced = sub.timeout.replace(armed);
        Ok((armed, replaced))
    }

    pub fn clear_timeout(&mut self, sid: SubscriptionId) -> Option<ArmedTimeout> {
        self.subs.get_mut(&sid.0).and_then(|s| s.timeout.take())
    }

    /// Claims a firing timer. Returns the timer only if `timer_id` is still
    /// the armed timer and the expected count has not been reached.
    pub fn take_expired_timeout(
        &mut self,
        sid: SubscriptionId,
        timer_id: u64,
    ) -> Option<ArmedTimeout> {
        let sub = self.subs.get_mut(&sid.0)?;
        match sub.timeout {
            Some(armed) if armed.timer_id == timer_id => {
                sub.timeout = None;
                (sub.received < armed.expected).then_some(armed)
            }
            _ => None,
        }
    }

    /// Marks every subscription draining and blocks new subscriptions.
    /// Returns the ids and the timeouts that were cleared.
    pub fn drain_all(&mut self) -> Vec<(SubscriptionId, Option<ArmedTimeout>)> {
        self.draining = true;
        self.subs
            .values_mut()
            .map(|sub| {
                sub.draining = true;
                (sub.sid, sub.timeout.take())
            })
            .collect()
    }

    /// Marks one subscription draining and clears its timeout.
    pub fn drain_one(&mut self, sid: SubscriptionId) -> Result<Option<ArmedTimeout>> {
        let sub = self
            .subs
            .get_mut(&sid.0)
            .ok_or(NatsError::UnknownSubscription(sid.0))?;
        if sub.draining {
            return Err(NatsError::SubscriptionDraining(sid.0));
        }
        sub.draining = true;
        Ok(sub.timeout.take())
    }

    /// Closes the registry and returns every subscription that was live.
    pub fn close(&mut self) -> Vec<Subscription<C>> {
        self.closed = true;
        std::mem::take(&mut self.subs).into_values().collect()
    }

    /// Entries to restore on a new server, in subscription order. Draining
    /// subscriptions are not restored.
    #[must_use]
    pub fn replay(&self) -> Vec<ReplayEntry> {
        self.subs
            .values()
            .filter(|s| !s.draining)
            .map(|s| ReplayEntry {
                sid: s.sid,
                subject: s.subject.clone(),
                queue: s.queue.clone(),
                remaining: s.remaining(),
            })
            .collect()
    }
}

impl<C: Clone> SubscriptionRegistry<C> {
    /// Records one delivery to `sid`. Returns `None` for unknown ids, which
    /// includes subscriptions already removed by their limit.
    pub fn deliver(&mut self, sid: SubscriptionId) -> Option<Delivery<C>> {
        let sub = self.subs.get_mut(&sid.0)?;
        if sub.max.is_some_and(|max| sub.received >= max) {
            return None;
        }
        sub.received += 1;

        let cleared_timeout = match sub.timeout {
            Some(armed) if sub.received >= armed.expected => sub.timeout.take(),
            _ => None,
        };
        let callback = sub.callback.clone();
        let removed = sub.max.is_some_and(|max| sub.received >= max);
        if removed {
            self.subs.remove(&sid.0);
        }
        Some(Delivery {
            sid,
            callback,
            removed,
            cleared_timeout,
        })
    }

    /// Local fan-out for `subject`: every plain subscriber, plus one
    /// uniformly chosen member of each queue group.
    pub fn dispatch(&mut self, subject: &str) -> Vec<Delivery<C>> {
        self.dispatch_filtered(subject, |_| true, &mut rand::thread_rng())
    }

    /// Fan-out restricted to subscriptions accepted by `filter`, using
    /// `rng` for queue-group selection.
    pub fn dispatch_filtered<F, R>(&mut self, subject: &str, filter: F, rng: &mut R) -> Vec<Delivery<C>>
    where
        F: Fn(&Subscription<C>) -> bool,
        R: Rng + ?Sized,
    {
        let mut plain = Vec::new();
        let mut groups: HashMap<&str, Vec<SubscriptionId>> = HashMap::new();
        let mut group_order: Vec<&str> = Vec::new();

        for sub in self.subs.values() {
            if !matches(&sub.subject, subject) || !filter(sub) {
                continue;
            }
            match sub.queue.as_deref() {
                None => plain.push(sub.sid),
                Some(queue) => {
                    let members = groups.entry(queue).or_default();
                    if members.is_empty() {
                        group_order.push(queue);
                    }
                    members.push(sub.sid);
                }
            }
        }

        let mut selected = plain;
        for queue in group_order {
            if let Some(members) = groups.get(queue) {
                selected.push(members[rng.gen_range(0..members.len())]);
            }
        }
        selected.sort_unstable();

        selected
            .into_iter()
            .filter_map(|sid| self.deliver(sid))
            .collect()
    }
}
