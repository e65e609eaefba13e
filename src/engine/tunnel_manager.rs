//! Tunnel Manager
//!
//! Shares SSH tunnels between sessions that reach the same remote endpoint
//! through the same SSH account. Each session holds a lease; the tunnel is
//! closed when the last lease is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::instrument;

use crate::engine::error::EngineResult;
use crate::engine::ssh_tunnel::{OpenSshOpener, PortForward, TunnelOpener};
use crate::engine::types::SshTunnelConfig;

/// Identity of a shareable tunnel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelKey {
    pub ssh_user: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl TunnelKey {
    pub fn new(ssh: &SshTunnelConfig, remote_host: &str, remote_port: u16) -> Self {
        Self {
            ssh_user: ssh.username.clone(),
            ssh_host: ssh.host.clone(),
            ssh_port: ssh.port,
            remote_host: remote_host.to_string(),
            remote_port,
        }
    }
}

/// A session's claim on a tunnel
///
/// `generation` ties the lease to the tunnel process it was issued for, so a
/// lease on a tunnel that has since been reopened cannot release the new one.
#[derive(Debug, PartialEq, Eq)]
pub struct TunnelLease {
    key: TunnelKey,
    local_port: u16,
    generation: u64,
}

impl TunnelLease {
    pub fn key(&self) -> &TunnelKey {
        &self.key
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

struct TunnelEntry {
    forward: Box<dyn PortForward>,
    refs: usize,
    generation: u64,
}

pub struct TunnelManager {
    opener: Arc<dyn TunnelOpener>,
    ready_timeout: Duration,
    tunnels: Mutex<HashMap<TunnelKey, TunnelEntry>>,
    next_generation: AtomicU64,
}

impl TunnelManager {
    pub fn new(opener: Arc<dyn TunnelOpener>, ready_timeout: Duration) -> Self {
        Self {
            opener,
            ready_timeout,
            tunnels: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Manager backed by the system `ssh` client
    pub fn openssh(ready_timeout: Duration) -> Self {
        Self::new(Arc::new(OpenSshOpener), ready_timeout)
    }

    /// Returns a lease on a tunnel to `remote_host:remote_port`, opening one if needed
    #[instrument(skip(self, ssh), fields(ssh_host = %ssh.host))]
    pub async fn acquire(
        &self,
        ssh: &SshTunnelConfig,
        remote_host: &str,
        remote_port: u16,
    ) -> EngineResult<TunnelLease> {
        let key = TunnelKey::new(ssh, remote_host, remote_port);
        let mut tunnels = self.tunnels.lock().await;

        if let Some(entry) = tunnels.get_mut(&key) {
            if entry.forward.is_running() {
                entry.refs += 1;
                tracing::debug!(refs = entry.refs, "reusing SSH tunnel");
                return Ok(TunnelLease {
                    key,
                    local_port: entry.forward.local_port(),
                    generation: entry.generation,
                });
            }

            tracing::warn!(stale_refs = entry.refs, "SSH tunnel died, reopening");
            if let Some(mut stale) = tunnels.remove(&key) {
                let _ = stale.forward.close().await;
            }
        }

        let forward = self
            .opener
            .open(ssh, remote_host, remote_port, self.ready_timeout)
            .await?;
        let local_port = forward.local_port();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        tunnels.insert(
            key.clone(),
            TunnelEntry {
                forward,
                refs: 1,
                generation,
            },
        );

        Ok(TunnelLease {
            key,
            local_port,
            generation,
        })
    }

    /// Like [`acquire`](Self::acquire), but the lease is released if the guard is dropped unreleased
    pub async fn acquire_guarded(
        self: &Arc<Self>,
        ssh: &SshTunnelConfig,
        remote_host: &str,
        remote_port: u16,
    ) -> EngineResult<TunnelGuard> {
        let lease = self.acquire(ssh, remote_host, remote_port).await?;
        Ok(TunnelGuard {
            tunnels: Arc::clone(self),
            lease: Some(lease),
        })
    }

    /// Drops a lease; the tunnel closes with its last lease
    #[instrument(skip(self, lease), fields(local_port = lease.local_port))]
    pub async fn release(&self, lease: TunnelLease) -> EngineResult<()> {
        let mut tunnels = self.tunnels.lock().await;

        let remaining = match tunnels.get_mut(&lease.key) {
            Some(entry) if entry.generation == lease.generation => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs
            }
            _ => {
                tracing::debug!("lease outlived its tunnel, nothing to release");
                return Ok(());
            }
        };

        if remaining == 0 {
            if let Some(mut entry) = tunnels.remove(&lease.key) {
                tracing::info!("closing SSH tunnel");
                entry.forward.close().await?;
            }
        }

        Ok(())
    }

    /// Whether the tunnel behind `lease` is still up
    pub async fn is_running(&self, lease: &TunnelLease) -> bool {
        let mut tunnels = self.tunnels.lock().await;
        tunnels
            .get_mut(&lease.key)
            .filter(|entry| entry.generation == lease.generation)
            .map(|entry| entry.forward.is_running())
            .unwrap_or(false)
    }

    pub async fn ref_count(&self, key: &TunnelKey) -> usize {
        let tunnels = self.tunnels.lock().await;
        tunnels.get(key).map(|entry| entry.refs).unwrap_or(0)
    }

    pub async fn active_count(&self) -> usize {
        self.tunnels.lock().await.len()
    }

    /// Closes every tunnel regardless of outstanding leases
    pub async fn close_all(&self) {
        let mut tunnels = self.tunnels.lock().await;
        for (_, mut entry) in tunnels.drain() {
            if let Err(e) = entry.forward.close().await {
                tracing::warn!(error = %e, "failed to close SSH tunnel");
            }
        }
    }
}

/// Holds a lease until it is released or handed off
///
/// Dropping an armed guard (for instance when the future holding it is
/// cancelled) releases the lease on a background task.
pub struct TunnelGuard {
    tunnels: Arc<TunnelManager>,
    lease: Option<TunnelLease>,
}

impl TunnelGuard {
    pub fn local_port(&self) -> u16 {
        self.lease.as_ref().map(TunnelLease::local_port).unwrap_or_default()
    }

    /// Disarms the guard; the caller becomes responsible for releasing the lease
    pub fn into_lease(mut self) -> Option<TunnelLease> {
        self.lease.take()
    }

    pub async fn release(mut self) -> EngineResult<()> {
        match self.lease.take() {
            Some(lease) => self.tunnels.release(lease).await,
            None => Ok(()),
        }
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let tunnels = Arc::clone(&self.tunnels);
                handle.spawn(async move {
                    if let Err(e) = tunnels.release(lease).await {
                        tracing::warn!(error = %e, "failed to release abandoned SSH tunnel lease");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(local_port = lease.local_port, "SSH tunnel lease dropped outside a runtime");
            }
        }
    }
}
