/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::sync::watch;

/// When the maximum number of simultaneous connections is reached, a batch
/// of the oldest connections is disconnected. The registry scan is O(N), so
/// evicting several clients per sweep amortizes better than one at a time.
pub const CLIENT_DESTROY_OLDEST_COUNT: usize = 16;

/// Disconnect client after idling this many seconds.
pub const CLIENT_LOGIN_IDLE_TIMEOUT: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    Inactivity,
    QueueFull,
    Shutdown,
}

impl Disconnect {
    pub fn bye_line(&self) -> Option<&'static [u8]> {
        match self {
            Disconnect::Inactivity => Some(b"* BYE Disconnected for inactivity.\r\n"),
            Disconnect::QueueFull | Disconnect::Shutdown => None,
        }
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Disconnect::Inactivity => Some("Disconnected: Inactivity"),
            Disconnect::QueueFull => Some("Disconnected: Connection queue full"),
            Disconnect::Shutdown => None,
        }
    }
}

/// Registry entry for one live session. The session task owns the socket;
/// the registry only holds the coarse clocks and a single-shot kill signal
/// that the session honors at its next suspension point.
pub struct ClientHandle {
    pub id: u64,
    pub created: u64,
    pub remote_ip: IpAddr,
    pub last_input: AtomicU64,
    pub input_blocked: AtomicBool,
    kill_tx: watch::Sender<Option<Disconnect>>,
}

impl ClientHandle {
    pub fn killed(&self) -> watch::Receiver<Option<Disconnect>> {
        self.kill_tx.subscribe()
    }

    /// Idempotent: only the first reason sticks.
    pub fn kill(&self, reason: Disconnect) {
        self.kill_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn touch(&self, now: u64) {
        self.last_input.store(now, Ordering::Relaxed);
    }
}

/// Process-wide table of live pre-login sessions, created at startup and
/// drained at shutdown. A one second timer sweeps it for idle clients.
pub struct Clients {
    sessions: DashMap<u64, Arc<ClientHandle>>,
    seq: AtomicU64,
    started: Instant,
    pub max_logging_users: usize,
    pub idle_timeout: u64,
}

impl Clients {
    pub fn new(max_logging_users: usize, idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Clients {
            sessions: DashMap::new(),
            seq: AtomicU64::new(0),
            started: Instant::now(),
            max_logging_users,
            idle_timeout: idle_timeout.as_secs(),
        })
    }

    /// Coarse clock shared by `created` and `last_input`.
    pub fn now(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn admit(&self, remote_ip: IpAddr) -> Arc<ClientHandle> {
        if self.max_logging_users > CLIENT_DESTROY_OLDEST_COUNT
            && self.sessions.len() >= self.max_logging_users
        {
            self.destroy_oldest();
        }

        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let now = self.now();
        let (kill_tx, _) = watch::channel(None);
        let handle = Arc::new(ClientHandle {
            id,
            created: now,
            remote_ip,
            last_input: AtomicU64::new(now),
            input_blocked: AtomicBool::new(false),
            kill_tx,
        });
        self.sessions.insert(id, handle.clone());
        handle
    }

    pub fn remove(&self, id: u64) {
        self.sessions.remove(&id);
    }

    /// Find the oldest clients in one scan, using a bounded insertion
    /// buffer, then kill them. Eviction is rare enough that no auxiliary
    /// ordering structure is kept.
    fn destroy_oldest(&self) {
        let mut destroy_buf: Vec<Arc<ClientHandle>> =
            Vec::with_capacity(CLIENT_DESTROY_OLDEST_COUNT);

        for entry in self.sessions.iter() {
            let client = entry.value();
            if let Some(pos) = destroy_buf
                .iter()
                .position(|old| old.created > client.created)
            {
                destroy_buf.insert(pos, client.clone());
                destroy_buf.truncate(CLIENT_DESTROY_OLDEST_COUNT);
            } else if destroy_buf.len() < CLIENT_DESTROY_OLDEST_COUNT {
                destroy_buf.push(client.clone());
            }
        }

        for client in destroy_buf {
            client.kill(Disconnect::QueueFull);
        }
    }

    /// 1s granularity idle sweep; runs until shutdown.
    pub fn spawn_idle_sweep(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = self.now();
                        for entry in self.sessions.iter() {
                            let client = entry.value();
                            if now.saturating_sub(client.last_input.load(Ordering::Relaxed))
                                >= self.idle_timeout
                            {
                                client.kill(Disconnect::Inactivity);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
    }

    /// Destroy every session without a logged reason.
    pub fn shutdown_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().kill(Disconnect::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Clients, Disconnect, CLIENT_DESTROY_OLDEST_COUNT};

    #[test]
    fn admit_evicts_oldest_batch() {
        let max = CLIENT_DESTROY_OLDEST_COUNT + 4;
        let clients = Clients::new(max, Duration::from_secs(60));
        let ip = "192.0.2.7".parse().unwrap();

        let mut handles = Vec::new();
        for _ in 0..max {
            handles.push(clients.admit(ip));
        }
        assert_eq!(clients.len(), max);

        // The next admission triggers one batch eviction.
        let newest = clients.admit(ip);
        let killed = handles
            .iter()
            .filter(|handle| handle.killed().borrow().is_some())
            .count();
        assert_eq!(killed, CLIENT_DESTROY_OLDEST_COUNT);
        assert!(newest.killed().borrow().is_none());
    }

    #[test]
    fn no_eviction_without_cap() {
        let clients = Clients::new(0, Duration::from_secs(60));
        let ip = "192.0.2.7".parse().unwrap();
        let handles: Vec<_> = (0..64).map(|_| clients.admit(ip)).collect();
        assert!(handles
            .iter()
            .all(|handle| handle.killed().borrow().is_none()));
    }

    #[test]
    fn kill_is_idempotent() {
        let clients = Clients::new(0, Duration::from_secs(60));
        let handle = clients.admit("192.0.2.7".parse().unwrap());
        handle.kill(Disconnect::Inactivity);
        handle.kill(Disconnect::Shutdown);
        assert_eq!(*handle.killed().borrow(), Some(Disconnect::Inactivity));
    }
}
