//! Registry of live sessions.
//!
//! The registry is the single owner of every open session: it assigns ids,
//! enforces client affinity on lookup, reaps idle sessions, and drains
//! in-flight work on shutdown. Sessions reference their owner tuple; only
//! the registry references sessions by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::task::JoinHandle;

use super::{ClientId, Session};
use crate::counters::Counters;
use crate::error::{Result, SessionError};

pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
    counters: Arc<Counters>,
}

impl SessionRegistry {
    pub fn new(counters: Arc<Counters>) -> Self {
        counters.register("sessions");
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            counters,
        }
    }

    /// Take ownership of a freshly opened session, assigning its id.
    pub fn register(&self, session: Session) -> Result<Arc<Session>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SessionError::ShuttingDown.into());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        session.assign_id(id);
        let session = Arc::new(session);

        let count = {
            let mut map = self.sessions.lock().expect("registry lock");
            map.insert(id, session.clone());
            map.len()
        };
        self.counters.set("sessions", count as u64);

        info!("{session}: registered for {}", session.owner());
        Ok(session)
    }

    /// Fetch a session, enforcing owner affinity: only the client that
    /// opened a session may address it.
    pub fn lookup(&self, id: u64, client: &ClientId) -> Result<Arc<Session>> {
        let map = self.sessions.lock().expect("registry lock");
        match map.get(&id) {
            Some(session) if session.owner() == client => Ok(session.clone()),
            _ => Err(SessionError::NotFound.into()),
        }
    }

    /// Close a session and drop it from the registry.
    ///
    /// A running command holds the session's command lock, so the close
    /// waits for it to finish (bounded by the command's own timeout).
    pub async fn evict(&self, id: u64) -> Result<()> {
        let session = {
            let mut map = self.sessions.lock().expect("registry lock");
            let session = map.remove(&id).ok_or(SessionError::NotFound)?;
            self.counters.set("sessions", map.len() as u64);
            session
        };

        if let Err(e) = session.close().await {
            warn!("{session}: close during evict failed: {e}");
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().expect("registry lock").len()
    }

    /// Evict every session whose idle clock has expired.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<u64> = {
            let map = self.sessions.lock().expect("registry lock");
            map.values()
                .filter(|s| s.is_idle(now))
                .map(|s| s.id())
                .collect()
        };

        for id in expired {
            info!("evicting idle session {id}");
            if let Err(e) = self.evict(id).await {
                error!("idle evict of session {id} failed: {e}");
            }
        }
    }

    /// Periodic idle sweep; runs until the handle is aborted.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep().await;
            }
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop accepting sessions, wait for in-flight work to drain, then
    /// force-close whatever is left.
    pub async fn shutdown(&self, max_wait: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        info!("shutdown: waiting up to {max_wait:?} for {} sessions", self.count());

        let deadline = Instant::now() + max_wait;
        while self.count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_secs(1)).await;
            info!("shutdown: pending sessions: {}", self.count());
        }

        let remaining: Vec<Arc<Session>> = {
            let mut map = self.sessions.lock().expect("registry lock");
            let remaining = map.drain().map(|(_, s)| s).collect();
            self.counters.set("sessions", 0);
            remaining
        };
        if !remaining.is_empty() {
            warn!("shutdown: force-closing {} sessions", remaining.len());
        }
        for session in remaining {
            let _ = session.close().await;
        }
    }
}
