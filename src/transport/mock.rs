//! Scripted transports for tests.
//!
//! A [`MockTransport`] plays back canned byte exchanges: each write is
//! matched against the script and the configured reply chunks are queued
//! for the next `recv` calls. Unscripted writes produce silence, which is
//! how timeout paths are exercised.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{Transport, TransportFactory};
use crate::device::ConnectionTarget;
use crate::error::{Result, TransportError};

#[derive(Debug, Clone)]
pub enum MockReply {
    /// Queue these chunks for delivery.
    Chunks(Vec<Vec<u8>>),
    /// Deliver nothing; the stream ends.
    Eof,
    /// Deliver nothing at all (lets timeouts fire).
    Silence,
}

/// Script for one connection: what arrives on connect, and how writes are
/// answered.
#[derive(Debug, Clone, Default)]
pub struct MockScript {
    pub initial: Vec<Vec<u8>>,
    pub replies: HashMap<Vec<u8>, MockReply>,
    pub reply_delay: Duration,
}

impl MockScript {
    /// A CLI device script: emits `prompt` on connect and echoes commands.
    pub fn cli(prompt: &str) -> Self {
        let mut script = Self::default();
        script.initial.push(format!("\n{prompt}").into_bytes());
        // Clearing the command line produces no output.
        script.replies.insert(vec![0x15], MockReply::Chunks(vec![]));
        script
    }

    /// Answer `command` with an echo, `body`, and the prompt again.
    pub fn on_command(mut self, command: &str, body: &str, prompt: &str) -> Self {
        let reply = format!("{command}\r\n{body}\r\n{prompt}");
        self.replies.insert(
            format!("{command}\n").into_bytes(),
            MockReply::Chunks(vec![reply.into_bytes()]),
        );
        self
    }

    /// Answer `command` with an echo and the prompt only (setup commands).
    pub fn on_setup(mut self, command: &str, prompt: &str) -> Self {
        let reply = format!("{command}\r\n{prompt}");
        self.replies.insert(
            format!("{command}\n").into_bytes(),
            MockReply::Chunks(vec![reply.into_bytes()]),
        );
        self
    }

    /// Answer raw written bytes with raw chunks.
    pub fn on_raw(mut self, written: &[u8], reply: MockReply) -> Self {
        self.replies.insert(written.to_vec(), reply);
        self
    }

    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }
}

pub struct MockTransport {
    script: MockScript,
    incoming: VecDeque<Vec<u8>>,
    pending_eof: bool,
    pub sent: Arc<Mutex<Vec<Vec<u8>>>>,
    pub closed: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new(script: MockScript) -> Self {
        let incoming = script.initial.iter().cloned().collect();
        Self {
            script,
            incoming,
            pending_eof: false,
            sent: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.sent.lock().unwrap().push(data.to_vec());
        match self.script.replies.get(data) {
            Some(MockReply::Chunks(chunks)) => self.incoming.extend(chunks.iter().cloned()),
            Some(MockReply::Eof) => self.pending_eof = true,
            Some(MockReply::Silence) | None => {}
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(chunk) = self.incoming.pop_front() {
            if !self.script.reply_delay.is_zero() {
                tokio::time::sleep(self.script.reply_delay).await;
            }
            return Ok(Some(chunk));
        }
        if self.pending_eof {
            return Ok(None);
        }
        // Nothing scripted: behave like a silent device.
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone)]
pub enum MockConnectOutcome {
    Accept(MockScript),
    Refused,
    AuthFail,
    Hang,
}

/// Handles into a created transport, for post-hoc assertions.
#[derive(Clone)]
pub struct TransportProbe {
    pub sent: Arc<Mutex<Vec<Vec<u8>>>>,
    pub closed: Arc<AtomicBool>,
}

impl TransportProbe {
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Per-address scripted factory.
#[derive(Default)]
pub struct MockFactory {
    outcomes: Mutex<HashMap<String, MockConnectOutcome>>,
    pub attempts: Mutex<Vec<String>>,
    pub created: Mutex<Vec<TransportProbe>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(self, addr: &str, outcome: MockConnectOutcome) -> Self {
        self.outcomes
            .lock()
            .unwrap()
            .insert(addr.to_string(), outcome);
        self
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn probes(&self) -> Vec<TransportProbe> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn connect(
        &self,
        target: &ConnectionTarget,
        addr: &str,
        _connect_timeout: Duration,
    ) -> Result<Box<dyn Transport>> {
        self.attempts.lock().unwrap().push(addr.to_string());
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get(addr)
            .cloned()
            .unwrap_or(MockConnectOutcome::Refused);

        match outcome {
            MockConnectOutcome::Accept(script) => {
                let transport = MockTransport::new(script);
                self.created.lock().unwrap().push(TransportProbe {
                    sent: transport.sent.clone(),
                    closed: transport.closed.clone(),
                });
                Ok(Box::new(transport))
            }
            MockConnectOutcome::Refused => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("connection refused: {addr}"),
            ))
            .into()),
            MockConnectOutcome::AuthFail => Err(TransportError::AuthenticationFailed {
                user: target.username.clone(),
            }
            .into()),
            MockConnectOutcome::Hang => loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            },
        }
    }
}
