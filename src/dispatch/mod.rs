//! Request dispatch: single-shot runs, bulk fan-out, session operations.
//!
//! The dispatcher sits behind the RPC boundary. Single-shot `run` and the
//! session operations surface failures to the caller; `bulk_run` folds
//! per-device failures into each device's result list and only fails as a
//! whole when this instance is shedding load.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use rand::Rng;
use tokio::task::JoinSet;

use crate::config::ServiceConfig;
use crate::counters::Counters;
use crate::device::{self, db::DeviceDb, Device};
use crate::error::{DispatchError, Error, Result, SessionError};
use crate::session::registry::SessionRegistry;
use crate::session::{ClientId, OpenParams, Session, SessionHandle};
use crate::transport::TransportFactory;
use crate::vendor::VendorRegistry;

/// Status string of a successful command.
pub const SUCCESS_STATUS: &str = "success";

/// Outcome of one command on one device.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Device output up to (not including) the terminating prompt, with the
    /// command echo stripped.
    pub output: String,

    /// `"success"`, or a failure message.
    pub status: String,

    /// The command that was issued.
    pub command: String,

    /// NETCONF server hello, on the first result of a NETCONF session.
    pub capabilities: Option<String>,

    /// Correlation id from the request.
    pub uuid: String,
}

impl CommandResult {
    pub fn success(
        command: impl Into<String>,
        output: impl Into<String>,
        capabilities: Option<String>,
        uuid: impl Into<String>,
    ) -> Self {
        Self {
            output: output.into(),
            status: SUCCESS_STATUS.to_string(),
            command: command.into(),
            capabilities,
            uuid: uuid.into(),
        }
    }

    pub fn failure(
        command: impl Into<String>,
        output: impl Into<String>,
        status: impl Into<String>,
        uuid: impl Into<String>,
    ) -> Self {
        Self {
            output: output.into(),
            status: status.into(),
            command: command.into(),
            capabilities: None,
            uuid: uuid.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SUCCESS_STATUS
    }
}

/// Hostname → per-command results, one entry per requested device.
pub type BulkResponse = HashMap<String, Vec<CommandResult>>;

/// One device and the ordered commands to run on it.
pub type BulkEntry = (Device, Vec<String>);

/// RPC client to a peer instance, used to shard oversized bulk calls.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn bulk_run_local(
        &self,
        entries: Vec<BulkEntry>,
        timeout: Duration,
        open_timeout: Duration,
        client: ClientId,
        uuid: String,
    ) -> Result<BulkResponse>;
}

/// Round-robin pool of peer instances.
#[derive(Default)]
pub struct PeerPool {
    peers: Vec<Arc<dyn PeerClient>>,
    next: AtomicUsize,
}

impl PeerPool {
    pub fn new(peers: Vec<Arc<dyn PeerClient>>) -> Self {
        Self {
            peers,
            next: AtomicUsize::new(0),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn next_peer(&self) -> Option<Arc<dyn PeerClient>> {
        if self.peers.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.peers.len();
        Some(self.peers[index].clone())
    }
}

/// Forwarded timeouts below this are rejected outright.
const MIN_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Dispatcher {
    vendors: Arc<VendorRegistry>,
    device_db: Arc<DeviceDb>,
    registry: Arc<SessionRegistry>,
    counters: Arc<Counters>,
    factory: Arc<dyn TransportFactory>,
    config: ServiceConfig,
    peers: Arc<PeerPool>,
    bulk_sessions: AtomicUsize,
}

impl Dispatcher {
    pub fn new(
        vendors: Arc<VendorRegistry>,
        device_db: Arc<DeviceDb>,
        registry: Arc<SessionRegistry>,
        counters: Arc<Counters>,
        factory: Arc<dyn TransportFactory>,
        config: ServiceConfig,
    ) -> Self {
        counters.register("bulk_run.local");
        counters.register("bulk_run.remote");
        counters.register("bulk_run.local.overload_error");
        counters.register("bulk_run.remote.overload_error");
        Self {
            vendors,
            device_db,
            registry,
            counters,
            factory,
            config,
            peers: Arc::new(PeerPool::empty()),
            bulk_sessions: AtomicUsize::new(0),
        }
    }

    pub fn with_peers(mut self, peers: PeerPool) -> Self {
        self.peers = Arc::new(peers);
        self
    }

    /// Run a single command on a single device over a transient session.
    pub async fn run(
        &self,
        command: &str,
        device: &Device,
        timeout: Duration,
        open_timeout: Duration,
        client: &ClientId,
        uuid: &str,
    ) -> Result<CommandResult> {
        let commands = vec![command.to_string()];
        let (mut results, failure) = self
            .run_device_commands(device, &commands, timeout, open_timeout, client, uuid)
            .await;

        if let Some((_, e)) = failure {
            self.counters.count_error(e.code());
            return Err(e);
        }
        results.pop().ok_or_else(|| {
            Error::Session(SessionError::Remote {
                message: "no result produced".into(),
            })
        })
    }

    /// Fan a device → commands map out, sharding to peers above the
    /// load-balance threshold. Every requested hostname is present in the
    /// response; failures are per-device.
    pub async fn bulk_run(
        self: &Arc<Self>,
        entries: Vec<BulkEntry>,
        timeout: Duration,
        open_timeout: Duration,
        client: &ClientId,
        uuid: &str,
    ) -> Result<BulkResponse> {
        let fits_locally = entries.len() < self.config.lb_threshold
            && self.bulk_sessions.load(Ordering::SeqCst) < self.config.bulk_session_limit;

        if fits_locally || self.peers.is_empty() {
            self.counters.increment("bulk_run.local");
            return self
                .bulk_run_local(entries, timeout, open_timeout, client, uuid)
                .await;
        }

        // The outer deadline still has to hold after the network hop.
        let remote_timeout = match timeout.checked_sub(self.config.remote_call_overhead()) {
            Some(t) if t > MIN_REMOTE_TIMEOUT => t,
            _ => return Err(DispatchError::TimeoutTooLow { timeout }.into()),
        };

        let mut tasks: JoinSet<BulkResponse> = JoinSet::new();
        for chunk in chunked(entries, self.config.lb_threshold) {
            let peers = self.peers.clone();
            let counters = self.counters.clone();
            let client = client.clone();
            let uuid = uuid.to_string();
            let retry_limit = self.config.bulk_retry_limit;
            let delay_min = self.config.bulk_retry_delay_min;
            let delay_max = self.config.bulk_retry_delay_max;

            tasks.spawn(async move {
                counters.increment("bulk_run.remote");
                let mut retries = 0;
                loop {
                    let peer = match peers.next_peer() {
                        Some(p) => p,
                        None => return bulk_failure(&chunk, "no peers available", &uuid),
                    };
                    let attempt = peer
                        .bulk_run_local(
                            chunk.clone(),
                            remote_timeout,
                            open_timeout,
                            client.clone(),
                            uuid.clone(),
                        )
                        .await;
                    match attempt {
                        Ok(map) => return map,
                        Err(e) => {
                            let overloaded =
                                matches!(e, Error::Dispatch(DispatchError::Overloaded { .. }));
                            if overloaded && retries < retry_limit {
                                // The peer was busy; stagger and try again,
                                // hopefully landing on a different instance.
                                counters.increment("bulk_run.remote.overload_error");
                                retries += 1;
                                let delay = rand::thread_rng()
                                    .gen_range(delay_min as f64..=delay_max as f64);
                                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                                continue;
                            }
                            warn!("forwarded bulk chunk failed: {e}");
                            return bulk_failure(&chunk, &status_of(&e), &uuid);
                        }
                    }
                }
            });
        }

        let mut response = BulkResponse::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(map) => response.extend(map),
                Err(e) => error!("bulk chunk task failed: {e}"),
            }
        }
        Ok(response)
    }

    /// Run a device → commands map entirely on this instance, one concurrent
    /// unit of work (and one transient session) per device.
    pub async fn bulk_run_local(
        self: &Arc<Self>,
        entries: Vec<BulkEntry>,
        timeout: Duration,
        open_timeout: Duration,
        client: &ClientId,
        uuid: &str,
    ) -> Result<BulkResponse> {
        let active = self.bulk_sessions.load(Ordering::SeqCst);
        if active + entries.len() > self.config.bulk_session_limit {
            self.counters.increment("bulk_run.local.overload_error");
            return Err(DispatchError::Overloaded { active }.into());
        }
        self.bulk_sessions.fetch_add(entries.len(), Ordering::SeqCst);

        let hostnames: Vec<String> = entries.iter().map(|(d, _)| d.hostname.clone()).collect();
        let jitter = self.config.bulk_run_jitter;

        let mut tasks: JoinSet<(String, Vec<CommandResult>)> = JoinSet::new();
        for (device, commands) in entries {
            let this = self.clone();
            let client = client.clone();
            let uuid = uuid.to_string();
            tasks.spawn(async move {
                // Stagger the opens to distribute the load.
                if jitter > 0 {
                    let delay = rand::thread_rng().gen_range(0.0..jitter as f64);
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }

                let (results, failure) = this
                    .run_device_commands(
                        &device,
                        &commands,
                        timeout,
                        open_timeout,
                        &client,
                        &uuid,
                    )
                    .await;
                // A failure collapses the device's list to the single
                // failing entry; results from completed commands are not
                // reported.
                let results = match failure {
                    Some((command, e)) => {
                        this.counters.count_error(e.code());
                        let partial = e.partial_output().unwrap_or_default();
                        vec![CommandResult::failure(command, partial, status_of(&e), &uuid)]
                    }
                    None => results,
                };
                (device.hostname.clone(), results)
            });
        }

        let mut response = BulkResponse::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((hostname, results)) => {
                    response.insert(hostname, results);
                }
                Err(e) => error!("bulk device task failed: {e}"),
            }
        }
        self.bulk_sessions
            .fetch_sub(hostnames.len(), Ordering::SeqCst);

        // Every requested hostname is answered, even if its task died.
        for hostname in hostnames {
            response.entry(hostname).or_insert_with(|| {
                vec![CommandResult::failure("", "", "device task failed", uuid)]
            });
        }
        Ok(response)
    }

    /// Open a persistent session bound to the calling client.
    pub async fn open_session(
        &self,
        device: &Device,
        open_timeout: Duration,
        idle_timeout: Duration,
        client: &ClientId,
        uuid: &str,
    ) -> Result<SessionHandle> {
        self.open_session_impl(device, open_timeout, idle_timeout, client, uuid, false)
            .await
    }

    /// Open a raw session: no setup commands, caller supplies prompts.
    pub async fn open_raw_session(
        &self,
        device: &Device,
        open_timeout: Duration,
        idle_timeout: Duration,
        client: &ClientId,
        uuid: &str,
    ) -> Result<SessionHandle> {
        self.open_session_impl(device, open_timeout, idle_timeout, client, uuid, true)
            .await
    }

    async fn open_session_impl(
        &self,
        device: &Device,
        open_timeout: Duration,
        idle_timeout: Duration,
        client: &ClientId,
        uuid: &str,
        raw: bool,
    ) -> Result<SessionHandle> {
        let result: Result<SessionHandle> = async {
            let session = self
                .open_device_session(device, open_timeout, idle_timeout, client, uuid, raw)
                .await?;
            Ok(session.handle())
        }
        .await;

        if let Err(e) = &result {
            self.counters.count_error(e.code());
        }
        result
    }

    /// Run a command on a previously opened session.
    pub async fn run_session(
        &self,
        handle: &SessionHandle,
        command: &str,
        timeout: Duration,
        client: &ClientId,
    ) -> Result<CommandResult> {
        self.run_session_impl(handle, command, timeout, client, None)
            .await
    }

    /// Run a command on a raw session with an explicit prompt pattern.
    pub async fn run_raw_session(
        &self,
        handle: &SessionHandle,
        command: &str,
        timeout: Duration,
        prompt_regex: &str,
        client: &ClientId,
    ) -> Result<CommandResult> {
        if prompt_regex.is_empty() {
            return Err(SessionError::PromptRequired.into());
        }
        // Reject a bad pattern before it reaches (and fails) the session.
        crate::channel::PromptSet::single(prompt_regex).map_err(SessionError::InvalidPrompt)?;
        self.run_session_impl(handle, command, timeout, client, Some(prompt_regex))
            .await
    }

    async fn run_session_impl(
        &self,
        handle: &SessionHandle,
        command: &str,
        timeout: Duration,
        client: &ClientId,
        prompt_override: Option<&str>,
    ) -> Result<CommandResult> {
        let session = self.registry.lookup(handle.id, client)?;

        match session.run(command, Some(timeout), prompt_override).await {
            Ok(output) => {
                let capabilities = session.take_capabilities().await;
                Ok(CommandResult::success(
                    command,
                    output,
                    capabilities,
                    session.uuid(),
                ))
            }
            Err(e) => {
                // Any failure is fatal for the session.
                self.counters.count_error(e.code());
                if let Err(evict_err) = self.registry.evict(handle.id).await {
                    debug!("evict after failed run_session: {evict_err}");
                }
                Err(e)
            }
        }
    }

    /// Close a session opened with `open_session`.
    pub async fn close_session(&self, handle: &SessionHandle, client: &ClientId) -> Result<()> {
        let session = self.registry.lookup(handle.id, client)?;
        self.registry.evict(session.id()).await
    }

    /// Close a raw session.
    pub async fn close_raw_session(&self, handle: &SessionHandle, client: &ClientId) -> Result<()> {
        self.close_session(handle, client).await
    }

    /// Counters snapshot for the stats exporter.
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    async fn open_device_session(
        &self,
        device: &Device,
        open_timeout: Duration,
        idle_timeout: Duration,
        client: &ClientId,
        uuid: &str,
        raw: bool,
    ) -> Result<Arc<Session>> {
        let info = self.device_db.get(device).await?;
        let target = device::resolve(device, &info, &self.vendors, &self.counters)?;
        let params = OpenParams {
            open_timeout,
            idle_timeout,
            raw,
            uuid: uuid.to_string(),
            owner: client.clone(),
        };
        let session =
            Session::open(target, self.factory.as_ref(), params, self.counters.clone()).await?;
        self.registry.register(session)
    }

    /// Run `commands` in order over one transient session.
    ///
    /// Returns the successful results plus the failure (with the command it
    /// struck) that aborted the sequence, if any. The session is always
    /// evicted before returning.
    async fn run_device_commands(
        &self,
        device: &Device,
        commands: &[String],
        timeout: Duration,
        open_timeout: Duration,
        client: &ClientId,
        uuid: &str,
    ) -> (Vec<CommandResult>, Option<(String, Error)>) {
        let session = match self
            .open_device_session(device, open_timeout, timeout, client, uuid, false)
            .await
        {
            Ok(session) => session,
            Err(e) => return (Vec::new(), Some((String::new(), e))),
        };

        let mut results = Vec::with_capacity(commands.len());
        let mut failure = None;
        for command in commands {
            match session.run(command, Some(timeout), None).await {
                Ok(output) => {
                    let capabilities = session.take_capabilities().await;
                    results.push(CommandResult::success(command, output, capabilities, uuid));
                }
                Err(e) => {
                    // Remaining commands for this device are skipped.
                    failure = Some((command.clone(), e));
                    break;
                }
            }
        }

        if let Err(e) = self.registry.evict(session.id()).await {
            debug!("evict of transient session failed: {e}");
        }
        (results, failure)
    }
}

/// Failure results for every command of every device in a chunk.
fn bulk_failure(entries: &[BulkEntry], message: &str, uuid: &str) -> BulkResponse {
    entries
        .iter()
        .map(|(device, commands)| {
            let results = commands
                .iter()
                .map(|c| CommandResult::failure(c, "", message, uuid))
                .collect();
            (device.hostname.clone(), results)
        })
        .collect()
}

/// Human-readable failure status, prefixed with the stable code name.
fn status_of(e: &Error) -> String {
    format!("{}: {}", e.code().name(), e)
}

fn chunked(entries: Vec<BulkEntry>, size: usize) -> Vec<Vec<BulkEntry>> {
    let mut chunks = Vec::new();
    let mut it = entries.into_iter().peekable();
    while it.peek().is_some() {
        chunks.push(it.by_ref().take(size.max(1)).collect());
    }
    chunks
}
