//! Interactive device sessions.
//!
//! A [`Session`] wraps one transport and drives it through the lifecycle
//! `connect → setup → ready ⇄ running → closed`. CLI sessions track vendor
//! prompt regexes over the byte stream to delimit command output; NETCONF
//! sessions frame on `]]>]]>` and capture the server hello as capabilities.
//!
//! At most one command is in flight per session: `run` serializes on the
//! session's internal mutex, so concurrent callers observe FIFO ordering.

pub mod registry;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::channel::{normalize_output, PromptMatch, PromptMatcher, PromptSet, NETCONF_EOM};
use crate::counters::Counters;
use crate::device::ConnectionTarget;
use crate::error::{Error, Result, SessionError, TransportError};
use crate::transport::{Transport, TransportFactory};
use crate::vendor::SessionKind;

/// Hello message sent to NETCONF peers after their hello is received.
const NETCONF_HELLO: &str = r#"<?xml version="1.0" encoding="UTF-8" ?>
<hello xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
  <capabilities>
    <capability>urn:ietf:params:netconf:base:1.0</capability>
  </capabilities>
</hello>
"#;

/// How much trailing output a timeout diagnostic carries.
const TIMEOUT_TAIL: usize = 200;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Setup,
    Ready,
    Running,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Setup => "SETUP",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Failed => "FAILED",
        }
    }
}

/// The client connection a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId {
    pub ip: String,
    pub port: u32,
}

impl ClientId {
    pub fn new(ip: impl Into<String>, port: u32) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Opaque reference handed back to clients of the session APIs.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub hostname: String,
    pub peer: String,
}

/// Parameters for opening a session.
#[derive(Debug, Clone)]
pub struct OpenParams {
    pub open_timeout: Duration,
    pub idle_timeout: Duration,
    pub raw: bool,
    pub uuid: String,
    pub owner: ClientId,
}

struct SessionInner {
    transport: Box<dyn Transport>,
    matcher: PromptMatcher,
    prompts: PromptSet,
    kind: SessionKind,
    cmd_timeout: Duration,
    clear_command: Vec<u8>,
    command_prompts: HashMap<String, String>,
    exit_command: Option<String>,
    capabilities: Option<String>,
    closed: bool,
}

/// One live session to one device.
pub struct Session {
    id: AtomicU64,
    hostname: String,
    peer: String,
    vendor_name: String,
    uuid: String,
    owner: ClientId,
    idle_timeout: Duration,
    state: StdMutex<SessionState>,
    last_activity: StdMutex<Instant>,
    counters: Arc<Counters>,
    inner: Mutex<SessionInner>,
}

impl Session {
    /// Resolve-and-connect: try each target address in order, run the setup
    /// sequence, and return a READY session. The whole phase is bounded by
    /// `open_timeout`.
    pub async fn open(
        target: ConnectionTarget,
        factory: &dyn TransportFactory,
        params: OpenParams,
        counters: Arc<Counters>,
    ) -> Result<Session> {
        counters.increment("session.setup");
        counters.increment(&format!("vendor.{}.sessions", target.vendor.vendor_name));

        let open_timeout = params.open_timeout;
        let result = tokio::time::timeout(
            open_timeout,
            Self::open_inner(target, factory, params, counters.clone()),
        )
        .await;

        match result {
            Ok(Ok(session)) => {
                counters.increment("session.connected");
                Ok(session)
            }
            Ok(Err(e)) => {
                counters.increment("session.failed");
                Err(e)
            }
            Err(_) => {
                counters.increment("session.failed");
                Err(TransportError::Timeout(open_timeout).into())
            }
        }
    }

    async fn open_inner(
        target: ConnectionTarget,
        factory: &dyn TransportFactory,
        params: OpenParams,
        counters: Arc<Counters>,
    ) -> Result<Session> {
        let mut last_err: Option<Error> = None;
        let mut connected: Option<(Box<dyn Transport>, String)> = None;

        for addr in &target.addrs {
            match factory.connect(&target, addr, params.open_timeout).await {
                Ok(transport) => {
                    connected = Some((transport, addr.clone()));
                    break;
                }
                Err(e) => {
                    warn!("{}: connect to {addr} failed: {e}", target.hostname);
                    last_err = Some(e);
                }
            }
        }

        let (transport, peer) = connected.ok_or_else(|| {
            last_err.unwrap_or_else(|| TransportError::Disconnected.into())
        })?;

        let mut inner = SessionInner {
            transport,
            matcher: PromptMatcher::new(),
            prompts: target.vendor.prompt_set().clone(),
            kind: target.kind,
            cmd_timeout: target.vendor.cmd_timeout,
            clear_command: target.clear_command.clone(),
            command_prompts: target.command_prompts.clone(),
            exit_command: target.vendor.exit_command.clone(),
            capabilities: None,
            closed: false,
        };

        let cmd_timeout = inner.cmd_timeout;
        match inner.kind {
            SessionKind::Ssh => {
                // Some devices skip the newline before the first prompt; a
                // synthetic one keeps prompt matching uniform.
                inner.matcher.feed(b"\n");
                wait_prompt(&mut inner, None, cmd_timeout).await?;

                if !params.raw {
                    for cmd in target.pre_setup.iter().chain(target.vendor.cli_setup.iter()) {
                        run_cli_command(&mut inner, cmd, cmd_timeout, None).await?;
                    }
                }
            }
            SessionKind::SshNetconf => {
                let hello = wait_eom(&mut inner, cmd_timeout).await?;
                inner.capabilities =
                    Some(String::from_utf8_lossy(&hello).trim().to_string());
                send_framed(&mut inner, NETCONF_HELLO).await?;
            }
        }

        let session = Session {
            id: AtomicU64::new(0),
            hostname: target.hostname.clone(),
            peer,
            vendor_name: target.vendor.vendor_name.clone(),
            uuid: params.uuid,
            owner: params.owner,
            idle_timeout: params.idle_timeout,
            state: StdMutex::new(SessionState::Ready),
            last_activity: StdMutex::new(Instant::now()),
            counters,
            inner: Mutex::new(inner),
        };

        info!("{session}: connected via {}", session.peer);
        Ok(session)
    }

    /// Run one command (or a multi-line configlet) and return its output.
    ///
    /// Commands are strictly serialized per session. `timeout` applies to
    /// each sub-command; `prompt_override` replaces the active prompt set
    /// (raw sessions).
    pub async fn run(
        &self,
        command: &str,
        timeout: Option<Duration>,
        prompt_override: Option<&str>,
    ) -> Result<String> {
        let mut inner = self.inner.lock().await;

        {
            let mut state = self.state.lock().expect("state lock");
            if *state != SessionState::Ready {
                return Err(SessionError::NotReady {
                    state: state.name(),
                }
                .into());
            }
            *state = SessionState::Running;
        }
        self.touch();

        let result = self
            .run_locked(&mut inner, command, timeout, prompt_override)
            .await;

        // A concurrent evict may have moved the state to CLOSING; only a
        // still-RUNNING session transitions back.
        let next = if result.is_ok() {
            SessionState::Ready
        } else {
            SessionState::Failed
        };
        {
            let mut state = self.state.lock().expect("state lock");
            if *state == SessionState::Running {
                *state = next;
            }
        }
        self.touch();
        result
    }

    async fn run_locked(
        &self,
        inner: &mut SessionInner,
        command: &str,
        timeout: Option<Duration>,
        prompt_override: Option<&str>,
    ) -> Result<String> {
        let timeout = timeout.unwrap_or(inner.cmd_timeout);

        let override_set = match prompt_override {
            Some(pattern) => Some(PromptSet::single(pattern).map_err(SessionError::InvalidPrompt)?),
            None => None,
        };

        // There should be no residual data between commands; drain whatever
        // is there to keep the stream in a sane state.
        let stale = inner.matcher.take();
        if !stale.is_empty() {
            warn!("{self}: {} bytes of stale data on session", stale.len());
        }

        debug!("{self}: RUN {command:?}");

        if inner.kind == SessionKind::SshNetconf {
            return run_netconf_command(inner, command, timeout).await;
        }

        let mut outputs = Vec::new();
        for line in command.lines() {
            let per_command = match &override_set {
                Some(_) => None,
                None => inner
                    .command_prompts
                    .get(line.trim())
                    .map(|p| PromptSet::single(p))
                    .transpose()
                    .map_err(SessionError::InvalidPrompt)?,
            };
            let active = override_set.as_ref().or(per_command.as_ref());

            let output = run_cli_command(inner, line, timeout, active).await?;
            outputs.push(output);
        }

        Ok(outputs.join("\n").trim().to_string())
    }

    /// Close the session. Idempotent: a second call is a no-op.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("state lock");
            if *state == SessionState::Closed {
                return Ok(());
            }
            *state = SessionState::Closing;
        }

        let mut inner = self.inner.lock().await;
        if !inner.closed {
            if inner.kind == SessionKind::Ssh {
                if let Some(exit) = inner.exit_command.clone() {
                    let _ = inner.transport.send(format!("{exit}\n").as_bytes()).await;
                }
            }
            if let Err(e) = inner.transport.close().await {
                debug!("{self}: transport close: {e}");
            }
            inner.closed = true;
            self.counters.increment("session.closed");
        }

        *self.state.lock().expect("state lock") = SessionState::Closed;
        info!("{self}: closed");
        Ok(())
    }

    /// The NETCONF server hello, surfaced once on the first result.
    pub async fn take_capabilities(&self) -> Option<String> {
        self.inner.lock().await.capabilities.take()
    }

    pub(crate) fn assign_id(&self, id: u64) {
        self.id.store(id, Ordering::SeqCst);
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn vendor_name(&self) -> &str {
        &self.vendor_name
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn owner(&self) -> &ClientId {
        &self.owner
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("state lock")
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id(),
            hostname: self.hostname.clone(),
            peer: self.peer.clone(),
        }
    }

    /// A RUNNING session is never idle; anything else is idle once its last
    /// activity is older than the idle timeout.
    pub fn is_idle(&self, now: Instant) -> bool {
        if self.state() == SessionState::Running {
            return false;
        }
        let last = *self.last_activity.lock().expect("activity lock");
        now.duration_since(last) > self.idle_timeout
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity lock") = Instant::now();
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session[{}] {} ({})", self.id(), self.hostname, self.uuid)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("hostname", &self.hostname)
            .field("peer", &self.peer)
            .field("vendor_name", &self.vendor_name)
            .field("uuid", &self.uuid)
            .finish_non_exhaustive()
    }
}

/// Send the clear byte and the command, then wait for a prompt.
async fn run_cli_command(
    inner: &mut SessionInner,
    line: &str,
    timeout: Duration,
    override_set: Option<&PromptSet>,
) -> Result<String> {
    if !inner.clear_command.is_empty() {
        let clear = inner.clear_command.clone();
        inner.transport.send(&clear).await?;
    }
    inner.transport.send(format!("{line}\n").as_bytes()).await?;

    let matched = wait_prompt(inner, override_set, timeout).await?;
    Ok(normalize_output(line, &matched.output))
}

/// Read chunks until the active prompt set matches or the timeout fires.
async fn wait_prompt(
    inner: &mut SessionInner,
    override_set: Option<&PromptSet>,
    timeout: Duration,
) -> Result<PromptMatch> {
    let deadline = tokio::time::Instant::now() + timeout;
    let SessionInner {
        transport, matcher, prompts, ..
    } = inner;
    let active = override_set.unwrap_or(prompts);

    loop {
        if let Some(matched) = matcher.match_prompt(active) {
            return Ok(matched);
        }
        match tokio::time::timeout_at(deadline, transport.recv()).await {
            Err(_) => return Err(timeout_error(matcher)),
            Ok(Ok(Some(chunk))) => matcher.feed(&chunk),
            Ok(Ok(None)) => {
                return Err(SessionError::StreamClosed {
                    partial: matcher.tail_text(TIMEOUT_TAIL),
                }
                .into())
            }
            Ok(Err(e)) => return Err(e),
        }
    }
}

/// Read chunks until a `]]>]]>`-framed message completes.
async fn wait_eom(inner: &mut SessionInner, timeout: Duration) -> Result<Vec<u8>> {
    let deadline = tokio::time::Instant::now() + timeout;
    let SessionInner {
        transport, matcher, ..
    } = inner;

    loop {
        if let Some(body) = matcher.match_eom() {
            return Ok(body);
        }
        match tokio::time::timeout_at(deadline, transport.recv()).await {
            Err(_) => return Err(timeout_error(matcher)),
            Ok(Ok(Some(chunk))) => matcher.feed(&chunk),
            Ok(Ok(None)) => {
                return Err(SessionError::StreamClosed {
                    partial: matcher.tail_text(TIMEOUT_TAIL),
                }
                .into())
            }
            Ok(Err(e)) => return Err(e),
        }
    }
}

/// Send a NETCONF payload framed with the EOM marker.
async fn send_framed(inner: &mut SessionInner, payload: &str) -> Result<()> {
    let mut framed = Vec::with_capacity(payload.len() + NETCONF_EOM.len() + 2);
    framed.push(b'\n');
    framed.extend_from_slice(payload.as_bytes());
    framed.extend_from_slice(NETCONF_EOM);
    framed.push(b'\n');
    inner.transport.send(&framed).await
}

async fn run_netconf_command(
    inner: &mut SessionInner,
    command: &str,
    timeout: Duration,
) -> Result<String> {
    send_framed(inner, command).await?;
    let body = wait_eom(inner, timeout).await?;
    Ok(String::from_utf8_lossy(&body).trim().to_string())
}

fn timeout_error(matcher: &mut PromptMatcher) -> Error {
    let partial = matcher.tail_text(TIMEOUT_TAIL);
    matcher.take();
    SessionError::CommandTimeout { partial }.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SessionData;
    use crate::error::FcrErrorCode;
    use crate::transport::mock::{MockConnectOutcome, MockFactory, MockReply, MockScript};
    use crate::vendor::VendorRegistry;

    const PROMPT: &str = "r1#";

    fn vendor_registry() -> VendorRegistry {
        let json = r##"{
            "vendor_config": {
                "arista-test": {
                    "prompt_regex": ["r1#"],
                    "cli_setup": ["en", "term len 0"],
                    "exit_command": "exit"
                }
            }
        }"##;
        VendorRegistry::with_config(json).unwrap()
    }

    fn cli_target(addrs: &[&str]) -> ConnectionTarget {
        ConnectionTarget {
            hostname: "rsw001".into(),
            addrs: addrs.iter().map(|s| s.to_string()).collect(),
            port: 22,
            username: "admin".into(),
            password: "pw".into(),
            vendor: vendor_registry().get("arista-test").unwrap(),
            kind: SessionKind::Ssh,
            session_data: SessionData::default(),
            clear_command: vec![0x15],
            command_prompts: HashMap::new(),
            pre_setup: vec![],
        }
    }

    fn cli_script() -> MockScript {
        MockScript::cli(PROMPT)
            .on_setup("en", PROMPT)
            .on_setup("term len 0", PROMPT)
    }

    fn open_params() -> OpenParams {
        OpenParams {
            open_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            raw: false,
            uuid: "req-uuid-1".into(),
            owner: ClientId::new("10.0.0.9", 4242),
        }
    }

    async fn open_cli(script: MockScript) -> (Session, MockFactory) {
        let factory =
            MockFactory::new().with_outcome("10.0.0.1", MockConnectOutcome::Accept(script));
        let session = Session::open(
            cli_target(&["10.0.0.1"]),
            &factory,
            open_params(),
            Arc::new(Counters::new()),
        )
        .await
        .unwrap();
        (session, factory)
    }

    #[tokio::test]
    async fn test_open_and_run() {
        let script = cli_script().on_command("show version", "Arista vEOS\nversion 4.30", PROMPT);
        let (session, _factory) = open_cli(script).await;
        assert_eq!(session.state(), SessionState::Ready);

        let output = session
            .run("show version", Some(Duration::from_secs(5)), None)
            .await
            .unwrap();
        assert_eq!(output, "Arista vEOS\nversion 4.30");
        assert!(!output.contains(PROMPT));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_setup_commands_sent_in_order() {
        let (session, factory) = open_cli(cli_script()).await;
        drop(session);

        let sent = factory.probes()[0].sent();
        let writes: Vec<&[u8]> = sent.iter().map(|v| v.as_slice()).collect();
        let en_pos = writes.iter().position(|w| *w == b"en\n").unwrap();
        let len_pos = writes.iter().position(|w| *w == b"term len 0\n").unwrap();
        assert!(en_pos < len_pos);
        // Each command is preceded by the clear byte.
        assert_eq!(writes[en_pos - 1], &[0x15]);
    }

    #[tokio::test]
    async fn test_pre_setup_runs_before_cli_setup() {
        let script = cli_script().on_setup("unlock-cli", PROMPT);
        let factory =
            MockFactory::new().with_outcome("10.0.0.1", MockConnectOutcome::Accept(script));
        let mut target = cli_target(&["10.0.0.1"]);
        target.pre_setup = vec!["unlock-cli".into()];

        Session::open(target, &factory, open_params(), Arc::new(Counters::new()))
            .await
            .unwrap();

        let sent = factory.probes()[0].sent();
        let writes: Vec<&[u8]> = sent.iter().map(|v| v.as_slice()).collect();
        let unlock_pos = writes.iter().position(|w| *w == b"unlock-cli\n").unwrap();
        let en_pos = writes.iter().position(|w| *w == b"en\n").unwrap();
        assert!(unlock_pos < en_pos);
    }

    #[tokio::test]
    async fn test_command_timeout_fails_session() {
        let script = cli_script().on_raw(b"slow\n", MockReply::Silence);
        let (session, _factory) = open_cli(script).await;

        let err = session
            .run("slow", Some(Duration::from_millis(50)), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), FcrErrorCode::CommandExecutionTimeout);
        assert_eq!(session.state(), SessionState::Failed);

        // A failed session refuses further commands.
        let err = session.run("x", None, None).await.unwrap_err();
        assert_eq!(err.code(), FcrErrorCode::Runtime);
    }

    #[tokio::test]
    async fn test_early_eof_is_stream_reader_error() {
        let script = cli_script().on_raw(b"crash\n", MockReply::Eof);
        let (session, _factory) = open_cli(script).await;

        let err = session
            .run("crash", Some(Duration::from_secs(5)), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), FcrErrorCode::StreamReader);
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let factory = MockFactory::new().with_outcome("10.0.0.1", MockConnectOutcome::AuthFail);
        let err = Session::open(
            cli_target(&["10.0.0.1"]),
            &factory,
            open_params(),
            Arc::new(Counters::new()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), FcrErrorCode::Permission);
    }

    #[tokio::test]
    async fn test_open_timeout() {
        let factory = MockFactory::new().with_outcome("10.0.0.1", MockConnectOutcome::Hang);
        let mut params = open_params();
        params.open_timeout = Duration::from_millis(50);

        let counters = Arc::new(Counters::new());
        let err = Session::open(cli_target(&["10.0.0.1"]), &factory, params, counters.clone())
            .await
            .unwrap_err();
        assert_eq!(err.code(), FcrErrorCode::ConnectionTimeout);
        assert_eq!(counters.get("session.failed"), 1);
    }

    #[tokio::test]
    async fn test_backup_ip_failover() {
        let factory = MockFactory::new()
            .with_outcome("10.0.0.1", MockConnectOutcome::Refused)
            .with_outcome("10.0.0.2", MockConnectOutcome::Accept(cli_script()));

        let session = Session::open(
            cli_target(&["10.0.0.1", "10.0.0.2"]),
            &factory,
            open_params(),
            Arc::new(Counters::new()),
        )
        .await
        .unwrap();

        assert_eq!(factory.attempts(), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(session.peer(), "10.0.0.2");
    }

    #[tokio::test]
    async fn test_all_addresses_fail() {
        let factory = MockFactory::new()
            .with_outcome("10.0.0.1", MockConnectOutcome::Refused)
            .with_outcome("10.0.0.2", MockConnectOutcome::Refused);

        let err = Session::open(
            cli_target(&["10.0.0.1", "10.0.0.2"]),
            &factory,
            open_params(),
            Arc::new(Counters::new()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), FcrErrorCode::ConnectionError);
        assert_eq!(factory.attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_configlet_runs_lines_in_order() {
        let script = cli_script()
            .on_command("conf t", "entering config", PROMPT)
            .on_command("hostname r2", "ok", PROMPT);
        let (session, factory) = open_cli(script).await;

        let output = session
            .run("conf t\nhostname r2", Some(Duration::from_secs(5)), None)
            .await
            .unwrap();
        assert_eq!(output, "entering config\nok");

        let sent = factory.probes()[0].sent();
        let writes: Vec<&[u8]> = sent.iter().map(|v| v.as_slice()).collect();
        let first = writes.iter().position(|w| *w == b"conf t\n").unwrap();
        let second = writes.iter().position(|w| *w == b"hostname r2\n").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn test_configlet_aborts_on_failure() {
        let script = cli_script()
            .on_command("ok-cmd", "fine", PROMPT)
            .on_raw(b"bad-cmd\n", MockReply::Silence)
            .on_command("never-cmd", "unreachable", PROMPT);
        let (session, factory) = open_cli(script).await;

        let err = session
            .run(
                "ok-cmd\nbad-cmd\nnever-cmd",
                Some(Duration::from_millis(50)),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), FcrErrorCode::CommandExecutionTimeout);

        let sent = factory.probes()[0].sent();
        assert!(!sent.iter().any(|w| w.as_slice() == b"never-cmd\n"));
    }

    #[tokio::test]
    async fn test_per_command_prompt_override() {
        let script = cli_script().on_raw(
            b"reboot\n",
            MockReply::Chunks(vec![b"reboot\r\nSystem going down\r\nAre you sure? ".to_vec()]),
        );
        let factory =
            MockFactory::new().with_outcome("10.0.0.1", MockConnectOutcome::Accept(script));
        let mut target = cli_target(&["10.0.0.1"]);
        target
            .command_prompts
            .insert("reboot".into(), r"Are you sure\?".into());

        let session = Session::open(target, &factory, open_params(), Arc::new(Counters::new()))
            .await
            .unwrap();

        let output = session
            .run("reboot", Some(Duration::from_secs(5)), None)
            .await
            .unwrap();
        assert_eq!(output, "System going down");
    }

    #[tokio::test]
    async fn test_raw_session_skips_setup() {
        // No setup replies scripted: a setup attempt would time out.
        let script = MockScript::cli(PROMPT).on_raw(
            b"ping target\n",
            MockReply::Chunks(vec![b"ping target\r\nalive\r\nwaiting> ".to_vec()]),
        );
        let factory =
            MockFactory::new().with_outcome("10.0.0.1", MockConnectOutcome::Accept(script));
        let mut params = open_params();
        params.raw = true;

        let session = Session::open(
            cli_target(&["10.0.0.1"]),
            &factory,
            params,
            Arc::new(Counters::new()),
        )
        .await
        .unwrap();

        let sent = factory.probes()[0].sent();
        assert!(!sent.iter().any(|w| w.as_slice() == b"en\n"));

        // The caller supplies the prompt for each raw command.
        let output = session
            .run(
                "ping target",
                Some(Duration::from_secs(5)),
                Some("waiting>"),
            )
            .await
            .unwrap();
        assert_eq!(output, "alive");
    }

    #[tokio::test]
    async fn test_invalid_prompt_override_rejected() {
        let (session, _factory) = open_cli(cli_script()).await;
        let err = session
            .run("x", Some(Duration::from_secs(1)), Some("[unclosed"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), FcrErrorCode::Parsing);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_sends_exit() {
        let counters = Arc::new(Counters::new());
        let script = cli_script();
        let factory =
            MockFactory::new().with_outcome("10.0.0.1", MockConnectOutcome::Accept(script));
        let session = Session::open(
            cli_target(&["10.0.0.1"]),
            &factory,
            open_params(),
            counters.clone(),
        )
        .await
        .unwrap();

        session.close().await.unwrap();
        session.close().await.unwrap();

        let probe = &factory.probes()[0];
        assert!(probe.is_closed());
        let exits = probe
            .sent()
            .iter()
            .filter(|w| w.as_slice() == b"exit\n")
            .count();
        assert_eq!(exits, 1);
        assert_eq!(counters.get("session.closed"), 1);
        assert_eq!(session.state(), SessionState::Closed);

        // A closed session refuses commands.
        let err = session.run("x", None, None).await.unwrap_err();
        assert_eq!(err.code(), FcrErrorCode::Runtime);
    }

    #[tokio::test]
    async fn test_commands_serialized_per_session() {
        let script = cli_script()
            .on_command("first", "one", PROMPT)
            .on_command("second", "two", PROMPT)
            .with_reply_delay(Duration::from_millis(10));
        let (session, factory) = open_cli(script).await;
        let session = Arc::new(session);

        let a = {
            let s = session.clone();
            tokio::spawn(async move { s.run("first", Some(Duration::from_secs(5)), None).await })
        };
        let b = {
            let s = session.clone();
            tokio::spawn(async move { s.run("second", Some(Duration::from_secs(5)), None).await })
        };
        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
        assert!(ra.is_ok() && rb.is_ok());

        // The second command's bytes must not appear between the first
        // command and its clear byte: writes come in (clear, cmd) pairs.
        let sent = factory.probes()[0].sent();
        let writes: Vec<&[u8]> = sent.iter().map(|v| v.as_slice()).collect();
        let cmd_positions: Vec<usize> = writes
            .iter()
            .enumerate()
            .filter(|(_, w)| **w == b"first\n" || **w == b"second\n")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(cmd_positions.len(), 2);
        assert_eq!(writes[cmd_positions[0] - 1], &[0x15]);
        assert_eq!(writes[cmd_positions[1] - 1], &[0x15]);
    }

    #[tokio::test]
    async fn test_idle_detection() {
        let (session, _factory) = open_cli(cli_script()).await;
        let now = Instant::now();
        assert!(!session.is_idle(now));
        assert!(session.is_idle(now + Duration::from_secs(120)));
    }

    fn netconf_target(registry: &VendorRegistry) -> ConnectionTarget {
        ConnectionTarget {
            hostname: "nc001".into(),
            addrs: vec!["10.0.0.5".into()],
            port: 22,
            username: "admin".into(),
            password: "pw".into(),
            vendor: registry.get_or_default("ncvendor").unwrap(),
            kind: SessionKind::SshNetconf,
            session_data: SessionData {
                subsystem: Some("netconf".into()),
                exec_command: None,
            },
            clear_command: vec![],
            command_prompts: HashMap::new(),
            pre_setup: vec![],
        }
    }

    #[tokio::test]
    async fn test_netconf_hello_and_reply() {
        let hello = b"<hello><capabilities>urn:base:1.0</capabilities></hello>\n]]>]]>";
        let mut script = MockScript::default();
        script.initial.push(hello.to_vec());
        let script = script.on_raw(
            b"\n<get/>]]>]]>\n",
            MockReply::Chunks(vec![b"<rpc-reply>ok</rpc-reply>\n]]>]]>".to_vec()]),
        );

        let factory =
            MockFactory::new().with_outcome("10.0.0.5", MockConnectOutcome::Accept(script));
        let registry = VendorRegistry::builtin().unwrap();
        let session = Session::open(
            netconf_target(&registry),
            &factory,
            open_params(),
            Arc::new(Counters::new()),
        )
        .await
        .unwrap();

        let output = session
            .run("<get/>", Some(Duration::from_secs(5)), None)
            .await
            .unwrap();
        assert_eq!(output, "<rpc-reply>ok</rpc-reply>");

        // The server hello is surfaced once.
        let caps = session.take_capabilities().await.unwrap();
        assert!(caps.contains("urn:base:1.0"));
        assert!(session.take_capabilities().await.is_none());

        // Our own hello went out framed.
        let sent = factory.probes()[0].sent();
        assert!(sent
            .iter()
            .any(|w| w.windows(7).any(|win| win == b"<hello ")));
    }
}
