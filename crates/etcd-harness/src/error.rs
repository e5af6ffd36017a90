use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::addr::AddressRole;
use crate::client::ClientError;
use crate::harness::HarnessState;

/// Convenience alias used throughout the crate.
pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

/// Errors that abort bringing up a harness.
///
/// Each variant names the setup stage that failed. Teardown problems are
/// never reported through this type; [`crate::Harness::stop`] logs them.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The server binary could not be resolved to an executable file.
    #[error("{binary:?} not found (not on PATH or not executable)")]
    BinaryNotFound { binary: String },

    /// Binding a loopback listener to obtain a free port failed.
    #[error("failed allocating {role} address")]
    AllocateAddress {
        role: AddressRole,
        #[source]
        source: io::Error,
    },

    /// The OS kept handing back the endpoint port for the peer address.
    #[error("peer address collided with endpoint {address} after {attempts} attempts")]
    DuplicateAddress { address: String, attempts: u32 },

    /// The isolated working directory could not be created.
    #[error("failed creating data directory under {}", .root.display())]
    CreateDataDir {
        root: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The OS refused to start the server process.
    #[error("cannot start {}", .binary.display())]
    Launch {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The client handle for the new instance could not be built.
    #[error("failed building client for {endpoint}")]
    Client {
        endpoint: String,
        #[source]
        source: ClientError,
    },

    /// The server started but never answered a readiness probe.
    #[error("instance not ready after {attempts} attempts in {elapsed:?}: {last_error}")]
    ReadinessTimeout {
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },

    /// `launch` was called on a harness that has already been used.
    #[error("harness cannot be launched from state {state:?}")]
    InvalidState { state: HarnessState },
}
