mod compile;
mod execute;
mod launcher;
mod memory;

pub use compile::{Artifact, CompileError, Toolchain, Workspace};
pub use execute::{CANCELLED_MESSAGE, RunSettings, TestRunner, outputs_match};
pub use launcher::{Invocation, LocalLauncher, ProcessLauncher, kill_process_group};
pub use memory::{MemoryWatch, read_peak_rss_kb};

use std::sync::Arc;

/// Creates the process launcher used for untrusted code
///
/// Only plain process spawning exists today; it provides timeouts and
/// process-tree cleanup but no security isolation.
pub fn create_launcher() -> Arc<dyn ProcessLauncher> {
    log::debug!("Using LocalLauncher (no isolation)");
    Arc::new(LocalLauncher)
}
