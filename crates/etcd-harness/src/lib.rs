//! Disposable local etcd instances for integration tests.
//!
//! A [`Harness`] allocates two loopback ports, launches `etcd` as a
//! single-node cluster in a private temporary directory, waits until it
//! answers requests, and hands back an [`EtcdClient`] pointing at it.
//! [`Harness::stop`] kills the process, reaps it, and removes the directory.
//!
//! ```no_run
//! use etcd_harness::{DiagnosticSink, Harness};
//!
//! # async fn demo() -> etcd_harness::Result<()> {
//! if !etcd_harness::etcd_available() {
//!     return Ok(());
//! }
//! let mut harness = Harness::start(DiagnosticSink::Inherit).await?;
//! let client = harness.client().expect("harness is ready").clone();
//! client.put("/testdir/somevalue", "SomeContent").await.ok();
//! harness.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod addr;
pub mod client;
pub mod config;
pub mod error;
pub mod harness;
pub mod probe;
pub mod process;

pub use client::{ClientError, EtcdClient};
pub use config::{HarnessConfig, InstanceConfig, ProbeConfig};
pub use error::{HarnessError, Result};
pub use harness::{Harness, HarnessState};
pub use probe::{ReadinessProbe, wait_until_ready};
pub use process::{DiagnosticSink, ServerProcess, Termination, binary_available};

/// Returns `true` if the configured etcd binary can be found.
///
/// Honours `ETCD_HARNESS_BINARY`, so the answer matches what
/// [`Harness::start`] would try to launch. Test suites should call this
/// first and skip themselves when it returns `false`.
pub fn etcd_available() -> bool {
    binary_available(&HarnessConfig::from_env().binary)
}
