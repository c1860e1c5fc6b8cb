use std::path::{Path, PathBuf};

use anyhow::Context;
use txseq_core::SequencerConfig;

/// Looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "txseq.yaml";

/// Resolve which config file applies.
///
/// Priority:
/// 1. `--config` flag / `TXSEQ_CONFIG` env var (passed in as `explicit`)
/// 2. `txseq.yaml` in `cwd`, if present
/// 3. None: built-in defaults
pub fn resolve_config_path(explicit: Option<&Path>, cwd: &Path) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    let local = cwd.join(DEFAULT_CONFIG_FILE);
    local.is_file().then_some(local)
}

/// Load the effective config, returning the file it came from (if any).
///
/// An explicit path that does not exist is an error; a missing
/// `txseq.yaml` just means defaults.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<(SequencerConfig, Option<PathBuf>)> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    match resolve_config_path(explicit, &cwd) {
        Some(path) => {
            let config = SequencerConfig::load(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?;
            tracing::debug!(path = %path.display(), "loaded config");
            Ok((config, Some(path)))
        }
        None => Ok((SequencerConfig::default(), None)),
    }
}
