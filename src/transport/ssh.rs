//! SSH transport implementation using russh.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use russh::client::{self, Handle, Msg};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg};

use super::config::{ChannelRequest, SshConfig, TERM_TYPE};
use super::Transport;
use crate::error::{Result, TransportError};

/// SSH transport wrapping a russh client session and one channel.
pub struct SshTransport {
    session: Handle<SshHandler>,
    channel: Channel<Msg>,
    eof: bool,
}

impl SshTransport {
    /// Connect, authenticate and open the requested channel.
    pub async fn connect(config: SshConfig) -> Result<Self> {
        let ssh_config = Arc::new(client::Config::default());

        info!("connecting to {}:{}", config.host, config.port);

        let mut session = tokio::time::timeout(
            config.connect_timeout,
            client::connect(
                ssh_config,
                (config.host.as_str(), config.port),
                SshHandler,
            ),
        )
        .await
        .map_err(|_| TransportError::Timeout(config.connect_timeout))?
        .map_err(TransportError::Ssh)?;

        Self::authenticate(&mut session, &config).await?;

        let channel = session
            .channel_open_session()
            .await
            .map_err(TransportError::Ssh)?;

        match &config.channel {
            ChannelRequest::Shell => {
                channel
                    .request_pty(true, TERM_TYPE, 511, 24, 0, 0, &[])
                    .await
                    .map_err(TransportError::Ssh)?;
                channel
                    .request_shell(true)
                    .await
                    .map_err(TransportError::Ssh)?;
            }
            ChannelRequest::Subsystem(name) => {
                channel
                    .request_subsystem(true, name)
                    .await
                    .map_err(TransportError::Ssh)?;
            }
            ChannelRequest::Exec(command) => {
                channel
                    .exec(true, command.as_bytes())
                    .await
                    .map_err(TransportError::Ssh)?;
            }
        }

        Ok(Self {
            session,
            channel,
            eof: false,
        })
    }

    async fn authenticate(session: &mut Handle<SshHandler>, config: &SshConfig) -> Result<()> {
        let success = session
            .authenticate_password(config.username.as_str(), config.password.as_str())
            .await
            .map_err(TransportError::Ssh)?
            .success();

        if !success {
            return Err(TransportError::AuthenticationFailed {
                user: config.username.clone(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.channel
            .data(data)
            .await
            .map_err(|_| TransportError::Disconnected)?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if self.eof {
            return Ok(None);
        }
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => return Ok(Some(data.to_vec())),
                // Stderr-flavored extended data is folded into the stream.
                Some(ChannelMsg::ExtendedData { data, .. }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("exit status received: {exit_status}");
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    self.eof = true;
                    return Ok(None);
                }
                Some(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.channel.eof().await;
        self.session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(TransportError::Ssh)?;
        Ok(())
    }
}

/// SSH client handler for russh.
///
/// Host-key verification is disabled: fleet devices regenerate keys on
/// re-image and connection setup must not depend on a known_hosts store.
struct SshHandler;

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}
