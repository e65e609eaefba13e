//! SSH Tunnel
//!
//! Provides SSH tunneling for connecting to databases behind firewalls.
//! Uses the native OpenSSH client for maximum compatibility.

use std::net::SocketAddr;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{SshAuth, SshHostKeyPolicy, SshTunnelConfig};

/// A local port forwarded to a remote endpoint
#[async_trait]
pub trait PortForward: Send {
    /// Local port on 127.0.0.1 the driver should connect to
    fn local_port(&self) -> u16;

    /// Whether the forward is still up
    fn is_running(&mut self) -> bool;

    /// Tears the forward down
    async fn close(&mut self) -> EngineResult<()>;
}

/// Opens port forwards; the tunnel manager is generic over it
#[async_trait]
pub trait TunnelOpener: Send + Sync {
    async fn open(
        &self,
        config: &SshTunnelConfig,
        remote_host: &str,
        remote_port: u16,
        ready_timeout: Duration,
    ) -> EngineResult<Box<dyn PortForward>>;
}

/// Opens tunnels by spawning the `ssh` binary
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenSshOpener;

#[async_trait]
impl TunnelOpener for OpenSshOpener {
    async fn open(
        &self,
        config: &SshTunnelConfig,
        remote_host: &str,
        remote_port: u16,
        ready_timeout: Duration,
    ) -> EngineResult<Box<dyn PortForward>> {
        let tunnel = SshTunnel::open(config, remote_host, remote_port, ready_timeout).await?;
        Ok(Box::new(tunnel))
    }
}

/// Represents an active SSH tunnel using native OpenSSH
pub struct SshTunnel {
    local_port: u16,
    process: Option<Child>,
}

impl SshTunnel {
    /// Opens an SSH tunnel to the remote database using native OpenSSH
    ///
    /// This spawns an `ssh -N -L` process for port forwarding and waits until
    /// the local port accepts connections. Password authentication (and key
    /// passphrases) go through `sshpass`, which must be installed.
    pub async fn open(
        config: &SshTunnelConfig,
        remote_host: &str,
        remote_port: u16,
        ready_timeout: Duration,
    ) -> EngineResult<Self> {
        config.validate()?;

        let local_port = match config.local_port {
            Some(port) => port,
            None => ephemeral_port().await?,
        };

        let args = build_ssh_args(config, remote_host, remote_port, local_port);

        tracing::debug!(
            ssh_host = %config.host,
            ssh_port = config.port,
            local_port,
            remote_host,
            remote_port,
            "spawning SSH tunnel"
        );

        let mut cmd = match &config.auth {
            SshAuth::Password { password } => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh").env("SSHPASS", password);
                cmd
            }
            SshAuth::Key {
                passphrase: Some(passphrase),
                ..
            } => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-P")
                    .arg("passphrase")
                    .arg("-e")
                    .arg("ssh")
                    .env("SSHPASS", passphrase);
                cmd
            }
            SshAuth::Key { passphrase: None, .. } => Command::new("ssh"),
        };

        let process = cmd
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    EngineError::ssh_error(
                        "'ssh' (or 'sshpass' for password auth) binary not found. Is OpenSSH installed?",
                    )
                } else {
                    EngineError::ssh_error(format!("Failed to spawn SSH process: {}", e))
                }
            })?;

        let mut tunnel = Self {
            local_port,
            process: Some(process),
        };
        tunnel.wait_until_ready(config, ready_timeout).await?;

        tracing::info!(local_port, ssh_host = %config.host, "SSH tunnel ready");
        Ok(tunnel)
    }

    /// Polls the forwarded port until it accepts connections or ssh exits
    async fn wait_until_ready(&mut self, config: &SshTunnelConfig, ready_timeout: Duration) -> EngineResult<()> {
        let deadline = Instant::now() + ready_timeout;
        let addr = SocketAddr::from(([127, 0, 0, 1], self.local_port));

        loop {
            let Some(process) = self.process.as_mut() else {
                return Err(EngineError::ssh_error("SSH process is gone"));
            };

            match process.try_wait() {
                Ok(Some(status)) => {
                    let stderr = read_stderr(process).await;
                    self.process = None;
                    tracing::error!(%status, ssh_host = %config.host, "SSH tunnel exited during startup");
                    return Err(EngineError::ssh_error(format!(
                        "ssh exited with status {} ({}@{}): {}",
                        status,
                        config.username,
                        config.host,
                        stderr.unwrap_or_else(|| "no error output".to_string())
                    )));
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(EngineError::ssh_error(format!(
                        "Failed to check SSH process status: {}",
                        e
                    )));
                }
            }

            if tokio::net::TcpStream::connect(addr).await.is_ok() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                if let Some(mut process) = self.process.take() {
                    let _ = process.start_kill();
                }
                return Err(EngineError::ssh_error(format!(
                    "Timed out after {}s waiting for local port {} (SSH host {})",
                    ready_timeout.as_secs(),
                    self.local_port,
                    config.host
                )));
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Returns the local port to connect to
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Returns the local address to use for database connection
    pub fn local_addr(&self) -> String {
        format!("127.0.0.1:{}", self.local_port)
    }

    /// Closes the tunnel
    pub async fn close(&mut self) -> EngineResult<()> {
        if let Some(mut process) = self.process.take() {
            process
                .kill()
                .await
                .map_err(|e| EngineError::ssh_error(format!("Failed to kill SSH process: {}", e)))?;
            let _ = process.wait().await;
        }
        Ok(())
    }
}

#[async_trait]
impl PortForward for SshTunnel {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn is_running(&mut self) -> bool {
        match self.process.as_mut() {
            Some(process) => matches!(process.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn close(&mut self) -> EngineResult<()> {
        SshTunnel::close(self).await
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            // Best effort kill on drop
            let _ = process.start_kill();
        }
    }
}

/// Binds port 0 and releases it so ssh can take the port
async fn ephemeral_port() -> EngineResult<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| EngineError::ssh_error(format!("Failed to bind local port: {}", e)))?;

    let port = listener
        .local_addr()
        .map_err(|e| EngineError::ssh_error(format!("Failed to get local address: {}", e)))?
        .port();

    Ok(port)
}

async fn read_stderr(process: &mut Child) -> Option<String> {
    let mut stderr = process.stderr.take()?;
    let mut buf = vec![0u8; 2048];
    let n = tokio::time::timeout(Duration::from_millis(500), stderr.read(&mut buf))
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or(0);
    let text = String::from_utf8_lossy(&buf[..n]).trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Arguments for `ssh`, without the binary name
pub(crate) fn build_ssh_args(
    config: &SshTunnelConfig,
    remote_host: &str,
    remote_port: u16,
    local_port: u16,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-N".to_string(),
        "-L".to_string(),
        format!("127.0.0.1:{}:{}:{}", local_port, remote_host, remote_port),
        "-p".to_string(),
        config.port.to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", config.connect_timeout_secs),
        "-o".to_string(),
        format!("ServerAliveInterval={}", config.keepalive_interval_secs),
        "-o".to_string(),
        format!("ServerAliveCountMax={}", config.keepalive_count_max),
    ];

    let strict = match config.host_key_policy {
        SshHostKeyPolicy::Strict => "yes",
        SshHostKeyPolicy::AcceptNew => "accept-new",
        SshHostKeyPolicy::InsecureNoCheck => "no",
    };
    args.push("-o".to_string());
    args.push(format!("StrictHostKeyChecking={}", strict));

    match (&config.known_hosts_path, config.host_key_policy) {
        (_, SshHostKeyPolicy::InsecureNoCheck) => {
            args.push("-o".to_string());
            args.push("UserKnownHostsFile=/dev/null".to_string());
        }
        (Some(path), _) => {
            args.push("-o".to_string());
            args.push(format!("UserKnownHostsFile={}", path));
        }
        (None, _) => {}
    }

    if let Some(ref jump) = config.proxy_jump {
        args.push("-J".to_string());
        args.push(jump.clone());
    }

    match &config.auth {
        SshAuth::Password { .. } => {
            args.push("-o".to_string());
            args.push("PreferredAuthentications=password,keyboard-interactive".to_string());
            args.push("-o".to_string());
            args.push("PubkeyAuthentication=no".to_string());
        }
        SshAuth::Key {
            private_key_path,
            passphrase,
        } => {
            if passphrase.is_none() {
                args.push("-o".to_string());
                args.push("BatchMode=yes".to_string());
            }
            args.push("-i".to_string());
            args.push(private_key_path.clone());
        }
    }

    // user@host stays last
    args.push(format!("{}@{}", config.username, config.host));

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_config() -> SshTunnelConfig {
        SshTunnelConfig::new(
            "bastion.example.com",
            22,
            "ubuntu",
            SshAuth::Key {
                private_key_path: "/home/ubuntu/.ssh/id_ed25519".to_string(),
                passphrase: None,
            },
        )
    }

    fn has_option(args: &[String], value: &str) -> bool {
        args.windows(2).any(|w| w[0] == "-o" && w[1] == value)
    }

    #[test]
    fn forwarding_spec_and_destination() {
        let args = build_ssh_args(&key_config(), "10.0.0.5", 5432, 44444);

        let l_idx = args.iter().position(|a| a == "-L").expect("-L must be present");
        assert_eq!(args[l_idx + 1], "127.0.0.1:44444:10.0.0.5:5432");
        assert_eq!(args.last().map(String::as_str), Some("ubuntu@bastion.example.com"));
        assert!(args.contains(&"-N".to_string()));
    }

    #[test]
    fn key_auth_runs_in_batch_mode() {
        let args = build_ssh_args(&key_config(), "db", 3306, 12345);

        assert!(has_option(&args, "BatchMode=yes"));
        let i_idx = args.iter().position(|a| a == "-i").expect("-i must be present");
        assert_eq!(args[i_idx + 1], "/home/ubuntu/.ssh/id_ed25519");
    }

    #[test]
    fn password_auth_disables_batch_mode() {
        let config = SshTunnelConfig::new(
            "bastion",
            2222,
            "bob",
            SshAuth::Password {
                password: "secret".to_string(),
            },
        );
        let args = build_ssh_args(&config, "db", 3306, 12345);

        assert!(!has_option(&args, "BatchMode=yes"));
        assert!(!args.contains(&"-i".to_string()));
        assert!(!args.iter().any(|a| a.contains("secret")));
        let p_idx = args.iter().position(|a| a == "-p").expect("-p must be present");
        assert_eq!(args[p_idx + 1], "2222");
    }

    #[test]
    fn host_key_policies() {
        let strict = key_config().with_host_key_policy(SshHostKeyPolicy::Strict);
        assert!(has_option(&build_ssh_args(&strict, "db", 1, 2), "StrictHostKeyChecking=yes"));

        let accept = key_config();
        let args = build_ssh_args(&accept, "db", 1, 2);
        assert!(has_option(&args, "StrictHostKeyChecking=accept-new"));
        assert!(!args.iter().any(|a| a.starts_with("UserKnownHostsFile=")));

        let insecure = key_config().with_host_key_policy(SshHostKeyPolicy::InsecureNoCheck);
        let args = build_ssh_args(&insecure, "db", 1, 2);
        assert!(has_option(&args, "StrictHostKeyChecking=no"));
        assert!(has_option(&args, "UserKnownHostsFile=/dev/null"));
    }

    #[test]
    fn known_hosts_and_jump_host() {
        let mut config = key_config();
        config.known_hosts_path = Some("/etc/ssh/known_hosts".to_string());
        config.proxy_jump = Some("jump@gateway:22".to_string());
        let args = build_ssh_args(&config, "db", 1, 2);

        assert!(has_option(&args, "UserKnownHostsFile=/etc/ssh/known_hosts"));
        let j_idx = args.iter().position(|a| a == "-J").expect("-J must be present");
        assert_eq!(args[j_idx + 1], "jump@gateway:22");
    }

    #[tokio::test]
    async fn open_rejects_invalid_config_before_spawning() {
        let config = SshTunnelConfig::new(
            "",
            22,
            "bob",
            SshAuth::Password {
                password: "pw".into(),
            },
        );
        let err = SshTunnel::open(&config, "db", 5432, Duration::from_secs(1))
            .await
            .err()
            .expect("invalid config must fail");
        assert!(matches!(err, EngineError::InvalidConfig { .. }));
    }
}
