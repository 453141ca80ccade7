//! The SSH endpoint pushes arrive on. Only public key auth and `git-receive-pack` exec requests are served.

pub mod auth;

use crate::{conf, git};
use async_trait::async_trait;
use auth::{AuthGate, PublicKeyBlob};
use lazy_regex::regex_captures;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodSet};
use russh_keys::key;
use std::collections::HashMap;
use std::hash::Hash;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Extended data stream id for stderr.
const STDERR: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SshdError {
    #[error("no usable host keys found; tried {0}")]
    NoHostKeys(String),

    #[error("invalid listen address '{0}'")]
    ListenAddress(String),

    #[error("ssh server stopped; {0}")]
    Server(#[from] std::io::Error),
}

/// A parsed exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCommand {
    pub operation: String,
    pub repo_path: String,
}

/// Accepts exactly `git-receive-pack '<path>'`.
pub fn parse_command(command: &str) -> Result<GitCommand, git::ReceiveError> {
    let Some((_, operation, repo_path)) = regex_captures!(r"^(git-receive-pack) '([^']+)'$", command)
    else {
        return Err(git::ReceiveError::UnsupportedCommand(command.to_string()));
    };

    Ok(GitCommand {
        operation: operation.to_string(),
        repo_path: repo_path.to_string(),
    })
}

/// Formats the `SSH_CONNECTION` value git hooks expect.
pub fn ssh_connection(peer: Option<SocketAddr>, local: Option<SocketAddr>) -> String {
    match (peer, local) {
        (Some(peer), Some(local)) => format!(
            "{} {} {} {}",
            peer.ip(),
            peer.port(),
            local.ip(),
            local.port()
        ),
        _ => "0 0 0 0".to_string(),
    }
}

/// Loads every configured host key type that is present. Missing or unreadable keys are skipped.
pub fn load_host_keys(config: &conf::Sshd) -> Result<Vec<key::KeyPair>, SshdError> {
    let mut keys = Vec::new();
    let mut tried = Vec::new();

    for key_type in &config.host_key_types {
        let path = config.host_key_path.replace("{key_type}", key_type);

        match russh_keys::load_secret_key(&path, None) {
            Ok(key) => {
                debug!(path = %path, key_type = %key_type, "Loaded host key");
                keys.push(key);
            }
            Err(e) => warn!(path = %path, key_type = %key_type, error = %e, "Skipping host key"),
        }

        tried.push(path);
    }

    if keys.is_empty() {
        return Err(SshdError::NoHostKeys(tried.join(", ")));
    }

    Ok(keys)
}

/// Exit status sent to the client once a push is over.
pub fn exit_status<E>(result: &Result<(), E>) -> u32 {
    match result {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Session channels that were opened but have not been handed to an exec request yet.
pub struct PendingChannels<K, C> {
    channels: HashMap<K, C>,
}

impl<K: Hash + Eq, C> PendingChannels<K, C> {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    pub fn open(&mut self, id: K, channel: C) {
        self.channels.insert(id, channel);
    }

    /// Hands the channel over to its exec request.
    pub fn take(&mut self, id: &K) -> Option<C> {
        self.channels.remove(id)
    }

    /// Forgets a channel the client closed without running anything.
    pub fn close(&mut self, id: &K) -> bool {
        self.channels.remove(id).is_some()
    }
}

impl<K: Hash + Eq, C> Default for PendingChannels<K, C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts connections and creates a handler per client.
#[derive(Debug, Clone)]
pub struct Server {
    auth: AuthGate,
    receiver: git::Receiver,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// `config_path` is the file the service was started with; the pre-receive hook loads the same one.
    pub fn new(config: &conf::Config, config_path: Option<PathBuf>) -> Self {
        Self {
            auth: AuthGate::new(&config.sshd.authorized_key_path),
            receiver: git::Receiver::new(&config.git).with_config_path(config_path),
            local_addr: config.sshd.listen_address.parse().ok(),
        }
    }

    #[instrument(skip_all, fields(origin = "sshd"))]
    pub async fn run(mut self, config: &conf::Sshd) -> Result<(), SshdError> {
        let keys = load_host_keys(config)?;

        let russh_config = Arc::new(russh::server::Config {
            methods: MethodSet::PUBLICKEY,
            keys,
            inactivity_timeout: Some(Duration::from_secs(config.inactivity_timeout)),
            auth_rejection_time: Duration::from_secs(config.auth_rejection_time),
            ..Default::default()
        });

        let listen_address: SocketAddr = config
            .listen_address
            .parse()
            .map_err(|_| SshdError::ListenAddress(config.listen_address.clone()))?;

        info!(address = %listen_address, "Listening for git pushes");

        russh::server::Server::run_on_address(&mut self, russh_config, listen_address).await?;

        Ok(())
    }
}

impl russh::server::Server for Server {
    type Handler = Connection;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Connection {
        debug!(peer = ?peer_addr, "Accepted connection");

        Connection {
            auth: self.auth.clone(),
            receiver: self.receiver.clone(),
            ssh_connection: ssh_connection(peer_addr, self.local_addr),
            fingerprint: None,
            channels: PendingChannels::new(),
        }
    }

    fn handle_session_error(&mut self, error: anyhow::Error) {
        warn!(error = %error, "SSH session ended with an error");
    }
}

/// Per connection state.
pub struct Connection {
    auth: AuthGate,
    receiver: git::Receiver,
    ssh_connection: String,
    /// Set once a key has been accepted.
    fingerprint: Option<String>,
    channels: PendingChannels<ChannelId, Channel<Msg>>,
}

#[async_trait]
impl russh::server::Handler for Connection {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let presented = PublicKeyBlob::from(public_key);

        match self.auth.authenticate(&presented).await {
            Some(identity) => {
                let fingerprint = identity.key.fingerprint();
                info!(user = %user, fingerprint = %fingerprint, as_user = %identity.user(), "Accepted public key");
                self.fingerprint = Some(fingerprint);
                Ok(Auth::Accept)
            }
            None => {
                warn!(user = %user, fingerprint = %presented.fingerprint(), "Rejected public key");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.open(channel.id(), channel);
        Ok(true)
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.channels.close(&channel_id) {
            debug!(channel = ?channel_id, "Channel closed before exec request");
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(mut channel) = self.channels.take(&channel_id) else {
            return Ok(());
        };

        let command = String::from_utf8_lossy(data).to_string();
        session.channel_success(channel_id);

        let request = parse_command(&command).map(|parsed| git::ReceiveRequest {
            operation: parsed.operation,
            repo_path: parsed.repo_path,
            fingerprint: self.fingerprint.clone().unwrap_or_default(),
            ssh_connection: self.ssh_connection.clone(),
        });

        let receiver = self.receiver.clone();
        let handle = session.handle();

        tokio::spawn(async move {
            let result = match request {
                Ok(request) => serve_receive(&receiver, &request, &mut channel).await,
                Err(e) => {
                    warn!(command = %command, "Rejected exec request");
                    let message = format!("{e}\n");
                    let _ = channel.extended_data(STDERR, message.as_bytes()).await;
                    Err(e)
                }
            };

            let code = exit_status(&result);
            if handle.exit_status_request(channel_id, code).await.is_err() {
                debug!(channel = ?channel_id, code, "Could not send exit status; client is gone");
            }
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });

        Ok(())
    }
}

async fn serve_receive(
    receiver: &git::Receiver,
    request: &git::ReceiveRequest,
    channel: &mut Channel<Msg>,
) -> Result<(), git::ReceiveError> {
    // Writers are detached from the channel; the reader borrows it for the rest of the push.
    let output = channel.make_writer();
    let errout = channel.make_writer_ext(Some(STDERR));
    let input = channel.make_reader();

    receiver
        .receive(request, input, output, errout)
        .await
        .map_err(|e| {
            error!(repo = %request.repo_path, error = %e, "Push failed");
            e
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn receive_pack_is_accepted() {
        assert_eq!(
            parse_command("git-receive-pack '/demo.git'").unwrap(),
            GitCommand {
                operation: "git-receive-pack".into(),
                repo_path: "/demo.git".into(),
            }
        );
    }

    #[rstest]
    #[case::upload_pack("git-upload-pack '/demo.git'")]
    #[case::unquoted("git-receive-pack /demo.git")]
    #[case::empty_path("git-receive-pack ''")]
    #[case::shell("ls -la")]
    #[case::chained("git-receive-pack '/demo.git'; rm -rf /")]
    #[case::empty("")]
    fn other_commands_are_rejected(#[case] command: &str) {
        assert!(matches!(
            parse_command(command),
            Err(git::ReceiveError::UnsupportedCommand(_))
        ));
    }

    #[test]
    fn ssh_connection_uses_both_endpoints() {
        let peer: SocketAddr = "10.0.0.5:51234".parse().unwrap();
        let local: SocketAddr = "10.0.0.1:2223".parse().unwrap();

        assert_eq!(
            ssh_connection(Some(peer), Some(local)),
            "10.0.0.5 51234 10.0.0.1 2223"
        );
        assert_eq!(ssh_connection(None, Some(local)), "0 0 0 0");
    }

    #[test]
    fn failed_push_exits_non_zero() {
        assert_eq!(exit_status::<git::ReceiveError>(&Ok(())), 0);
        assert_eq!(
            exit_status(&Err(git::ReceiveError::Forbidden("demo".into()))),
            1
        );
    }

    #[test]
    fn closed_channels_are_forgotten() {
        let mut channels = PendingChannels::new();
        channels.open(1, "session");
        channels.open(2, "exec");

        assert!(channels.close(&1));
        assert!(!channels.close(&1));
        assert_eq!(channels.take(&1), None);
        assert_eq!(channels.take(&2), Some("exec"));
        assert_eq!(channels.take(&2), None);
    }

    #[test]
    fn missing_host_keys_fail_startup() {
        let dir = tempfile::tempdir().unwrap();
        let config = conf::Sshd {
            host_key_types: vec!["rsa".into(), "ed25519".into()],
            host_key_path: format!("{}/ssh_host_{{key_type}}_key", dir.path().display()),
            ..Default::default()
        };

        let Err(SshdError::NoHostKeys(tried)) = load_host_keys(&config) else {
            panic!("expected startup to fail without host keys");
        };
        assert!(tried.contains("ssh_host_rsa_key"));
        assert!(tried.contains("ssh_host_ed25519_key"));
    }
}
