//! The harness: bring-up with rollback, and idempotent teardown.

use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::addr::{AddressRole, allocate_local_address};
use crate::client::EtcdClient;
use crate::config::{DATA_DIR_PREFIX, HarnessConfig, InstanceConfig};
use crate::error::{HarnessError, Result};
use crate::probe::wait_until_ready;
use crate::process::{DiagnosticSink, ServerProcess, SharedWriter, resolve_executable};

/// How many times the peer address is re-drawn if it equals the endpoint.
const MAX_PAIR_ATTEMPTS: u32 = 5;

/// Where a harness is in its life.
///
/// ```text
/// Uninitialized -> AllocatingAddresses -> Launching -> Probing -> Ready
///                         \                  |            /
///                          +------------> Failed <-------+
/// Ready | Failed | (any) --stop--> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessState {
    Uninitialized,
    AllocatingAddresses,
    Launching,
    Probing,
    Ready,
    Failed,
    Stopped,
}

/// A disposable etcd instance.
///
/// Owns the server process and its working directory exclusively. Build one
/// with [`Harness::start`] (or [`Harness::new`] + [`Harness::launch`]) and
/// always finish with [`Harness::stop`]; dropping without `stop` falls back
/// to a best-effort kill.
///
/// Lifecycle calls take `&mut self`, so one harness cannot be started and
/// stopped concurrently. Separate harnesses share nothing and may run side
/// by side.
pub struct Harness {
    config: HarnessConfig,
    state: HarnessState,
    notes: Option<SharedWriter>,
    process: Option<ServerProcess>,
    data_dir: Option<PathBuf>,
    client: Option<EtcdClient>,
    endpoint: Option<String>,
    peer: Option<String>,
}

impl Harness {
    /// An unstarted harness. Performs no I/O.
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            state: HarnessState::Uninitialized,
            notes: None,
            process: None,
            data_dir: None,
            client: None,
            endpoint: None,
            peer: None,
        }
    }

    /// Start an instance configured from the environment
    /// ([`HarnessConfig::from_env`]).
    pub async fn start(sink: DiagnosticSink) -> Result<Self> {
        Self::start_with(HarnessConfig::from_env(), sink).await
    }

    /// Start an instance with an explicit config.
    ///
    /// On error nothing is left behind: any process already started is
    /// killed and reaped and the working directory is removed.
    pub async fn start_with(config: HarnessConfig, sink: DiagnosticSink) -> Result<Self> {
        let mut harness = Self::new(config);
        harness.launch(sink).await?;
        Ok(harness)
    }

    /// Bring an unstarted harness up to [`HarnessState::Ready`].
    ///
    /// On failure everything acquired so far is torn down and the harness
    /// is left in [`HarnessState::Failed`]; calling [`Harness::stop`]
    /// afterwards is still allowed.
    pub async fn launch(&mut self, sink: DiagnosticSink) -> Result<()> {
        if self.state != HarnessState::Uninitialized {
            return Err(HarnessError::InvalidState { state: self.state });
        }
        self.notes = sink.note_writer();

        match self.bring_up(sink).await {
            Ok(()) => {
                self.state = HarnessState::Ready;
                info!(
                    endpoint = self.endpoint.as_deref().unwrap_or_default(),
                    pid = self.pid().unwrap_or_default(),
                    "etcd harness ready"
                );
                Ok(())
            }
            Err(e) => {
                warn!(stage = ?self.state, error = %e, "etcd harness setup failed, cleaning up");
                self.teardown().await;
                self.state = HarnessState::Failed;
                Err(e)
            }
        }
    }

    async fn bring_up(&mut self, sink: DiagnosticSink) -> Result<()> {
        // Resolved first so a missing binary leaves no trace at all.
        let binary = resolve_executable(&self.config.binary)?;

        self.state = HarnessState::AllocatingAddresses;
        let (endpoint_addr, peer_addr) = allocate_address_pair()?;
        let endpoint = format!("http://{endpoint_addr}");
        let peer = format!("http://{peer_addr}");

        let root = self.config.temp_root();
        let data_dir = tempfile::Builder::new()
            .prefix(DATA_DIR_PREFIX)
            .tempdir_in(&root)
            .map_err(|source| HarnessError::CreateDataDir {
                root: root.clone(),
                source,
            })?
            .keep();
        self.data_dir = Some(data_dir.clone());
        self.endpoint = Some(endpoint.clone());
        self.peer = Some(peer.clone());

        let instance =
            InstanceConfig::single_node(&endpoint, &peer, &data_dir, &self.config.extra_env);

        self.state = HarnessState::Launching;
        let process = ServerProcess::launch(&binary, &instance, sink)?;
        debug!(pid = process.pid(), %endpoint, %peer, data_dir = %data_dir.display(), "etcd launched");
        self.process = Some(process);

        let client = EtcdClient::new(&endpoint).map_err(|source| HarnessError::Client {
            endpoint: endpoint.clone(),
            source,
        })?;
        self.client = Some(client.clone());

        self.state = HarnessState::Probing;
        let waited = wait_until_ready(&client, &self.config.probe).await?;
        debug!(?waited, "etcd answered readiness probe");
        Ok(())
    }

    /// Kill the server, wait for it to exit and delete its directory.
    ///
    /// Safe to call in any state and any number of times. Problems are
    /// logged and written to the diagnostic sink (unless it is `Discard` or
    /// `Tracing`) but never returned.
    pub async fn stop(&mut self) {
        if self.state == HarnessState::Stopped {
            debug!("etcd harness already stopped");
            return;
        }
        self.teardown().await;
        self.state = HarnessState::Stopped;
        info!("etcd harness stopped");
    }

    /// Process first, then directory, so the directory is never removed
    /// under a live server.
    async fn teardown(&mut self) {
        if let Some(process) = self.process.take() {
            let pid = process.pid();
            let done = process.terminate().await;
            if let Some(e) = done.kill_error {
                self.note(&format!("failed killing etcd process {pid}: {e}"));
            }
            match done.status {
                Ok(status) => debug!(pid, %status, "etcd process exited"),
                Err(e) => self.note(&format!("failed waiting for etcd process {pid}: {e}")),
            }
        }

        if let Some(dir) = self.data_dir.take() {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!(dir = %dir.display(), "removed etcd data dir"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => self.note(&format!(
                    "failed clearing temporary dir {}: {e}",
                    dir.display()
                )),
            }
        }
    }

    fn note(&self, message: &str) {
        warn!("{message}");
        if let Some(writer) = &self.notes {
            if let Ok(mut w) = writer.lock() {
                let _ = writeln!(w, "etcd-harness: {message}");
            }
        }
    }

    pub fn state(&self) -> HarnessState {
        self.state
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Client for the running instance. `None` until launched, and after a
    /// failed launch.
    pub fn client(&self) -> Option<&EtcdClient> {
        match self.state {
            HarnessState::Ready | HarnessState::Stopped => self.client.as_ref(),
            _ => None,
        }
    }

    /// Client URL, e.g. `http://127.0.0.1:40211`.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Peer URL used for the instance's own raft traffic.
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Working directory, while it exists.
    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// OS pid of the server, while it is owned by the harness.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ServerProcess::pid)
    }
}

impl fmt::Debug for Harness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Harness")
            .field("state", &self.state)
            .field("endpoint", &self.endpoint)
            .field("peer", &self.peer)
            .field("pid", &self.pid())
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

/// Best-effort cleanup when [`Harness::stop`] was never called.
///
/// The directory is only removed once the killed process has been reaped;
/// if that does not happen within a short bound the directory is left in
/// place and a warning is logged.
impl Drop for Harness {
    fn drop(&mut self) {
        if self.process.is_none() && self.data_dir.is_none() {
            return;
        }
        warn!(
            endpoint = self.endpoint.as_deref().unwrap_or_default(),
            "etcd harness dropped without stop(), killing best-effort"
        );
        if let Some(mut process) = self.process.take() {
            if !process.kill_now() {
                if let Some(dir) = self.data_dir.take() {
                    warn!(
                        pid = process.pid(),
                        dir = %dir.display(),
                        "etcd still running on drop, leaving its data dir"
                    );
                }
                return;
            }
        }
        if let Some(dir) = self.data_dir.take() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %e, "failed clearing temporary dir on drop");
            }
        }
    }
}

/// Endpoint and peer `host:port` strings that are guaranteed to differ.
fn allocate_address_pair() -> Result<(String, String)> {
    let endpoint = allocate_local_address().map_err(|source| HarnessError::AllocateAddress {
        role: AddressRole::Endpoint,
        source,
    })?;

    for _ in 0..MAX_PAIR_ATTEMPTS {
        let peer = allocate_local_address().map_err(|source| HarnessError::AllocateAddress {
            role: AddressRole::Peer,
            source,
        })?;
        if peer != endpoint {
            return Ok((endpoint, peer));
        }
        debug!(%peer, "peer address equals endpoint, allocating again");
    }

    Err(HarnessError::DuplicateAddress {
        address: endpoint,
        attempts: MAX_PAIR_ATTEMPTS,
    })
}
