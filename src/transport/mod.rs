//! Transport layer: byte streams to devices.
//!
//! The session engine consumes the [`Transport`] trait; the production
//! implementation is [`SshTransport`] over russh. [`TransportFactory`] is
//! the seam the dispatcher uses to open connections, so tests can substitute
//! scripted transports.

pub mod config;
#[cfg(test)]
pub mod mock;
mod ssh;

use async_trait::async_trait;
use std::time::Duration;

use crate::device::ConnectionTarget;
use crate::error::Result;

pub use config::{ChannelRequest, SshConfig, TERM_TYPE};
pub use ssh::SshTransport;

/// An established byte stream to one device.
#[async_trait]
pub trait Transport: Send {
    /// Write bytes to the device.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive the next chunk; `None` means the stream reached EOF.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;

    /// Tear the connection down.
    async fn close(&mut self) -> Result<()>;
}

/// Opens transports for resolved connection targets.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        target: &ConnectionTarget,
        addr: &str,
        connect_timeout: Duration,
    ) -> Result<Box<dyn Transport>>;
}

/// Production factory: SSH for everything.
pub struct SshTransportFactory;

#[async_trait]
impl TransportFactory for SshTransportFactory {
    async fn connect(
        &self,
        target: &ConnectionTarget,
        addr: &str,
        connect_timeout: Duration,
    ) -> Result<Box<dyn Transport>> {
        let config = SshConfig::for_target(target, addr, connect_timeout);
        Ok(Box::new(SshTransport::connect(config).await?))
    }
}
