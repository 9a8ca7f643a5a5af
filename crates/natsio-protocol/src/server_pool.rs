//! Ordered set of candidate servers with rotation and cluster discovery.

use crate::error::{NatsError, Result};
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::time::Instant;
use url::Url;

pub const DEFAULT_PORT: u16 = 4222;
pub const DEFAULT_URL: &str = "nats://localhost:4222";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub url: Url,
    /// Learned from cluster gossip rather than configured.
    pub implicit: bool,
    pub reconnects: u32,
    pub did_connect: bool,
    pub last_attempt: Option<Instant>,
}

impl Server {
    pub fn parse(address: &str, implicit: bool) -> Result<Self> {
        let address = address.trim();
        let with_scheme = if address.contains("://") {
            address.to_string()
        } else {
            format!("nats://{address}")
        };
        let mut url = Url::parse(&with_scheme)?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(NatsError::BadOptions(format!(
                "server url has no host: {address:?}"
            )));
        }
        if url.port().is_none() {
            url.set_port(Some(DEFAULT_PORT)).map_err(|()| {
                NatsError::BadOptions(format!("server url cannot carry a port: {address:?}"))
            })?;
        }
        Ok(Self {
            url,
            implicit,
            reconnects: 0,
            did_connect: false,
            last_attempt: None,
        })
    }

    #[must_use]
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or("localhost")
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.url.port().unwrap_or(DEFAULT_PORT)
    }

    /// `host:port`, the identity used to de-duplicate servers.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.url.scheme().eq_ignore_ascii_case("tls")
    }

    /// Credentials embedded in the url: `user:pass@` or a bare `token@`.
    #[must_use]
    pub fn user_info(&self) -> Option<(String, Option<String>)> {
        let user = self.url.username();
        if user.is_empty() {
            return None;
        }
        Some((user.to_string(), self.url.password().map(str::to_string)))
    }
}

#[derive(Debug, Clone)]
pub struct ServerPool {
    servers: VecDeque<Server>,
    no_randomize: bool,
}

impl ServerPool {
    /// Builds the pool from configured urls, keeping their order unless
    /// `randomize_configured` is set.
    pub fn new<S: AsRef<str>>(
        urls: &[S],
        no_randomize: bool,
        randomize_configured: bool,
    ) -> Result<Self> {
        let mut servers: Vec<Server> = if urls.is_empty() {
            vec![Server::parse(DEFAULT_URL, false)?]
        } else {
            urls.iter()
                .map(|u| Server::parse(u.as_ref(), false))
                .collect::<Result<_>>()?
        };
        if randomize_configured && !no_randomize {
            servers.shuffle(&mut rand::thread_rng());
        }
        Ok(Self {
            servers: servers.into(),
            no_randomize,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter()
    }

    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.url.to_string()).collect()
    }

    /// Rotates the front server to the back and selects it. Servers that
    /// have used up `max_reconnects` are dropped from the pool.
    pub fn next_server(&mut self, max_reconnects: Option<u32>) -> Option<Server> {
        while let Some(server) = self.servers.pop_front() {
            if max_reconnects.is_some_and(|max| server.reconnects >= max) {
                tracing::debug!(server = %server.url, reconnects = server.reconnects, "removing server from pool");
                continue;
            }
            self.servers.push_back(server);
            return self.servers.back().cloned();
        }
        None
    }

    /// The most recently selected server.
    #[must_use]
    pub fn current(&self) -> Option<&Server> {
        self.servers.back()
    }

    pub fn current_mut(&mut self) -> Option<&mut Server> {
        self.servers.back_mut()
    }

    pub fn mark_attempt(&mut self, reconnecting: bool) {
        if let Some(server) = self.current_mut() {
            if reconnecting {
                server.reconnects += 1;
            }
            server.last_attempt = Some(Instant::now());
        }
    }

    pub fn mark_connected(&mut self) {
        if let Some(server) = self.current_mut() {
            server.reconnects = 0;
            server.did_connect = true;
        }
    }

    /// Appends servers learned from `connect_urls`, skipping known
    /// addresses. New entries are shuffled among themselves unless
    /// randomization is disabled. Returns the added addresses.
    pub fn add_discovered<S: AsRef<str>>(&mut self, connect_urls: &[S]) -> Vec<String> {
        let mut added: Vec<Server> = Vec::new();
        for raw in connect_urls {
            let server = match Server::parse(raw.as_ref(), true) {
                Ok(server) => server,
                Err(e) => {
                    tracing::warn!(url = raw.as_ref(), error = %e, "ignoring invalid discovered server");
                    continue;
                }
            };
            let address = server.address();
            let known = self.servers.iter().chain(added.iter()).any(|s| s.address() == address);
            if !known {
                added.push(server);
            }
        }
        if !self.no_randomize {
            added.shuffle(&mut rand::thread_rng());
        }
        let addresses = added.iter().map(Server::address).collect();
        self.servers.extend(added);
        addresses
    }
}
