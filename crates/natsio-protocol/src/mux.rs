//! Shared-inbox request multiplexing.
//!
//! One wildcard subscription on `<root>.*` receives every reply; each
//! request gets a token and publishes with `<root>.<token>` as its reply
//! subject. Entries leave the pending map exactly once: on the reply that
//! completes them, on cancel, or on timeout.

use crate::inbox::{Nuid, INBOX_PREFIX};
use crate::registry::SubscriptionId;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestToken(String);

impl RequestToken {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct MuxEntry<C> {
    pub token: RequestToken,
    pub callback: C,
    pub max: Option<u64>,
    pub received: u64,
    pub timeout: Option<Duration>,
    pub timer_id: Option<u64>,
    pub created: Instant,
}

impl<C> MuxEntry<C> {
    /// Replies required before a timeout stops counting as a failure.
    #[must_use]
    pub fn expected(&self) -> u64 {
        self.max.unwrap_or(1)
    }
}

/// A reply routed to its pending request.
#[derive(Debug, Clone)]
pub struct MuxDelivery<C> {
    pub token: RequestToken,
    pub callback: C,
    /// The entry reached its reply limit and was removed; `timer_id` is the
    /// timer to clear.
    pub completed: bool,
    pub timer_id: Option<u64>,
}

#[derive(Debug)]
pub struct RequestMux<C> {
    root: Option<String>,
    inbox_sid: Option<SubscriptionId>,
    pending: HashMap<String, MuxEntry<C>>,
    nuid: Nuid,
    next_timer_id: u64,
}

impl<C> Default for RequestMux<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> RequestMux<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: None,
            inbox_sid: None,
            pending: HashMap::new(),
            nuid: Nuid::new(),
            next_timer_id: 1,
        }
    }

    /// Inbox root; created on first use under `prefix`.
    pub fn root_or_init(&mut self, prefix: &str) -> &str {
        let nuid = &mut self.nuid;
        self.root
            .get_or_insert_with(|| format!("{prefix}.{}", nuid.next_id()))
    }

    #[must_use]
    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    #[must_use]
    pub fn subscription_subject(&self) -> Option<String> {
        self.root.as_ref().map(|root| format!("{root}.*"))
    }

    #[must_use]
    pub fn inbox_sid(&self) -> Option<SubscriptionId> {
        self.inbox_sid
    }

    pub fn set_inbox_sid(&mut self, sid: SubscriptionId) {
        self.inbox_sid = Some(sid);
    }

    #[must_use]
    pub fn is_inbox(&self, sid: SubscriptionId) -> bool {
        self.inbox_sid == Some(sid)
    }

    /// Registers a pending request and returns its token, reply subject and
    /// timer id (when a timeout is set).
    pub fn register(
        &mut self,
        callback: C,
        max: Option<u64>,
        timeout: Option<Duration>,
    ) -> (RequestToken, String, Option<u64>) {
        let root = self.root_or_init(INBOX_PREFIX).to_string();
        let token = RequestToken(self.nuid.next_id());
        let timer_id = timeout.map(|_| {
            let id = self.next_timer_id;
            self.next_timer_id += 1;
            id
        });
        self.pending.insert(
            token.0.clone(),
            MuxEntry {
                token: token.clone(),
                callback,
                max,
                received: 0,
                timeout,
                timer_id,
                created: Instant::now(),
            },
        );
        let reply = format!("{root}.{token}");
        (token, reply, timer_id)
    }

    #[must_use]
    pub fn get(&self, token: &RequestToken) -> Option<&MuxEntry<C>> {
        self.pending.get(&token.0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Removes a pending request. Returns `None` if it already completed.
    pub fn cancel(&mut self, token: &RequestToken) -> Option<MuxEntry<C>> {
        self.pending.remove(&token.0)
    }

    /// Claims a firing timer. The entry is removed whenever the timer is
    /// still current; the caller reports a timeout only if fewer than the
    /// expected replies arrived.
    pub fn take_timed_out(&mut self, token: &RequestToken, timer_id: u64) -> Option<MuxEntry<C>> {
        match self.pending.get(&token.0) {
            Some(entry) if entry.timer_id == Some(timer_id) => self.pending.remove(&token.0),
            _ => None,
        }
    }

    /// Drops every pending request, returning them for timer cleanup.
    pub fn clear(&mut self) -> Vec<MuxEntry<C>> {
        self.pending.drain().map(|(_, entry)| entry).collect()
    }

    fn token_of<'a>(&self, subject: &'a str) -> Option<&'a str> {
        let root = self.root.as_deref()?;
        subject
            .strip_prefix(root)
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|token| !token.is_empty() && !token.contains('.'))
    }
}

impl<C: Clone> RequestMux<C> {
    /// Routes a reply on `subject` to its pending request. Late or unknown
    /// replies return `None`.
    pub fn resolve(&mut self, subject: &str) -> Option<MuxDelivery<C>> {
        let token = self.token_of(subject)?.to_string();
        let entry = self.pending.get_mut(&token)?;
        entry.received += 1;
        let completed = entry.max.is_none_or(|max| entry.received >= max);
        let delivery = MuxDelivery {
            token: entry.token.clone(),
            callback: entry.callback.clone(),
            completed,
            timer_id: entry.timer_id,
        };
        if completed {
            self.pending.remove(&token);
        }
        Some(delivery)
    }
}
