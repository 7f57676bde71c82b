//! Static fixture files shipped with the drill.
//!
//! - `large-sleep.json`: a single-instance long-running `sleep` workload.
//! - `net-services-agent.sh`: the partition script. `sh net-services-agent.sh fail`
//!   drops all traffic except loopback and SSH; with no argument it restores
//!   full connectivity.

use std::path::{Path, PathBuf};

use crate::errors::{DrillError, DrillResult};

/// File name of the bundled workload descriptor.
pub const WORKLOAD_DESCRIPTOR: &str = "large-sleep.json";

/// File name of the bundled partition script.
pub const PARTITION_SCRIPT: &str = "net-services-agent.sh";

/// Directory holding the fixtures bundled with this crate.
pub fn default_fixture_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
}

/// Resolve `name` against `dir` (absolute names are taken as-is) and check it exists.
pub fn resolve(dir: &Path, name: &str) -> DrillResult<PathBuf> {
    let candidate = Path::new(name);
    let path = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        dir.join(candidate)
    };
    if path.is_file() {
        Ok(path)
    } else {
        Err(DrillError::Fixture(path))
    }
}

/// Read and parse a workload descriptor.
pub fn load_descriptor(path: &Path) -> DrillResult<serde_json::Value> {
    if !path.is_file() {
        return Err(DrillError::Fixture(path.to_path_buf()));
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
