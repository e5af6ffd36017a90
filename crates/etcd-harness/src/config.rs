//! Harness settings and the etcd command line derived from them.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Binary looked up on `PATH` when nothing else is configured.
pub const DEFAULT_BINARY: &str = "etcd";

/// Prefix of every working directory the harness creates.
pub const DATA_DIR_PREFIX: &str = "etcd_testserver";

/// Bounds for the readiness loop.
///
/// The worst-case wait is `max_attempts * per_attempt_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// How many probes to issue before giving up.
    pub max_attempts: u32,
    /// Upper bound on a single probe, including the pause before the next.
    pub per_attempt_timeout: Duration,
}

impl ProbeConfig {
    pub const DEFAULT_ATTEMPTS: u32 = 20;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);

    pub fn new(max_attempts: u32, per_attempt_timeout: Duration) -> Self {
        Self {
            max_attempts,
            per_attempt_timeout,
        }
    }

    /// Attempts actually made; zero is treated as one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Total time the loop may spend before reporting a timeout.
    pub fn budget(&self) -> Duration {
        self.per_attempt_timeout * self.attempts()
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ATTEMPTS, Self::DEFAULT_TIMEOUT)
    }
}

/// Everything a [`crate::Harness`] needs to know before it starts.
///
/// Reads `ETCD_HARNESS_*` environment variables via [`HarnessConfig::from_env`];
/// tests usually build one explicitly with [`HarnessConfig::new`] and the
/// `with_*` methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Binary name (searched on `PATH`) or path to the server executable.
    pub binary: String,
    /// Directory under which the working directory is created. `None` means
    /// the system temp dir.
    pub temp_root: Option<PathBuf>,
    /// Readiness polling bounds.
    pub probe: ProbeConfig,
    /// Extra environment variables for the server process.
    pub extra_env: Vec<(String, String)>,
}

impl HarnessConfig {
    pub const BINARY_ENV: &str = "ETCD_HARNESS_BINARY";
    pub const TMPDIR_ENV: &str = "ETCD_HARNESS_TMPDIR";
    pub const ATTEMPTS_ENV: &str = "ETCD_HARNESS_PROBE_ATTEMPTS";
    pub const TIMEOUT_ENV: &str = "ETCD_HARNESS_PROBE_TIMEOUT_MS";

    /// Defaults for everything except the binary.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            temp_root: None,
            probe: ProbeConfig::default(),
            extra_env: Vec::new(),
        }
    }

    /// Build a config from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (testable without
    /// touching the real environment).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let binary = lookup(Self::BINARY_ENV)
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| DEFAULT_BINARY.to_owned());
        let temp_root = lookup(Self::TMPDIR_ENV)
            .filter(|d| !d.is_empty())
            .map(PathBuf::from);
        let max_attempts = parse_or_default(
            Self::ATTEMPTS_ENV,
            lookup(Self::ATTEMPTS_ENV),
            ProbeConfig::DEFAULT_ATTEMPTS,
        );
        let timeout_ms = parse_or_default(
            Self::TIMEOUT_ENV,
            lookup(Self::TIMEOUT_ENV),
            ProbeConfig::DEFAULT_TIMEOUT.as_millis() as u64,
        );

        Self {
            binary,
            temp_root,
            probe: ProbeConfig::new(max_attempts, Duration::from_millis(timeout_ms)),
            extra_env: Vec::new(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.push((key.into(), value.into()));
        self
    }

    /// Directory under which working directories are created.
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(env::temp_dir)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn parse_or_default<T: FromStr + Copy>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparseable setting, using default");
            default
        }),
    }
}

/// The command line and environment of one server process.
///
/// Computed once per harness and handed to
/// [`crate::ServerProcess::launch`]; never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    args: Vec<OsString>,
    data_dir: PathBuf,
    env: Vec<(String, String)>,
}

impl InstanceConfig {
    /// An arbitrary command line run inside `data_dir`.
    pub fn new(
        args: impl IntoIterator<Item = impl Into<OsString>>,
        data_dir: impl Into<PathBuf>,
        env: Vec<(String, String)>,
    ) -> Self {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            data_dir: data_dir.into(),
            env,
        }
    }

    /// A single-node etcd that starts a fresh cluster of one, serves clients
    /// on `endpoint_url`, talks raft on `peer_url`, keeps its state in
    /// `data_dir` and only logs warnings and above.
    pub fn single_node(
        endpoint_url: &str,
        peer_url: &str,
        data_dir: &Path,
        extra_env: &[(String, String)],
    ) -> Self {
        let mut data_dir_arg = OsString::from("--data-dir=");
        data_dir_arg.push(data_dir);

        let args = vec![
            OsString::from("--name=default"),
            data_dir_arg,
            format!("--listen-client-urls={endpoint_url}").into(),
            format!("--advertise-client-urls={endpoint_url}").into(),
            format!("--listen-peer-urls={peer_url}").into(),
            format!("--initial-advertise-peer-urls={peer_url}").into(),
            format!("--initial-cluster=default={peer_url}").into(),
            OsString::from("--force-new-cluster=true"),
            OsString::from("--log-level=warn"),
        ];

        Self {
            args,
            data_dir: data_dir.to_path_buf(),
            env: extra_env.to_vec(),
        }
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }
}
