//! SSH connection configuration.

use std::time::Duration;

use crate::device::{ConnectionTarget, SessionData};
use crate::vendor::SessionKind;

/// Terminal type requested for interactive shells.
pub const TERM_TYPE: &str = "vt100";

/// Parameters for one SSH connection attempt.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Target address (hostname or IP).
    pub host: String,

    /// SSH port (default: 22).
    pub port: u16,

    /// Username for authentication.
    pub username: String,

    /// Password for authentication. Network devices in the fleet use
    /// password auth; key-based auth is handled upstream by bastions.
    pub password: String,

    /// Bound on the TCP connect + SSH handshake.
    pub connect_timeout: Duration,

    /// Channel flavor: interactive shell or NETCONF.
    pub channel: ChannelRequest,
}

/// What to request on the opened channel.
#[derive(Debug, Clone)]
pub enum ChannelRequest {
    /// PTY + shell, for CLI sessions.
    Shell,
    /// Named SSH subsystem (preferred for NETCONF when configured).
    Subsystem(String),
    /// Exec a command on the channel (NETCONF fallback).
    Exec(String),
}

impl SshConfig {
    /// Build the config for one address of a resolved target.
    pub fn for_target(target: &ConnectionTarget, addr: &str, connect_timeout: Duration) -> Self {
        let channel = match target.kind {
            SessionKind::Ssh => ChannelRequest::Shell,
            SessionKind::SshNetconf => channel_for_netconf(&target.session_data),
        };
        Self {
            host: addr.to_string(),
            port: target.port,
            username: target.username.clone(),
            password: target.password.clone(),
            connect_timeout,
            channel,
        }
    }
}

fn channel_for_netconf(data: &SessionData) -> ChannelRequest {
    // Subsystem wins when both are configured; the resolver guarantees at
    // least one is set.
    if let Some(subsystem) = &data.subsystem {
        ChannelRequest::Subsystem(subsystem.clone())
    } else {
        ChannelRequest::Exec(data.exec_command.clone().unwrap_or_default())
    }
}
