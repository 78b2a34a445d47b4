use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::anyhow;

use crate::error::Result;

/// Describes the guest interpreter to launch: the executable and any
/// environment overlay. Provisioning the interpreter (downloading, package
/// installation) is a separate concern; this is only the descriptor the
/// launcher consumes.
#[derive(Debug, Clone)]
pub struct GuestRuntime {
    /// Path to the interpreter executable.
    pub python: PathBuf,
    /// Environment variables overlaid on the inherited host environment.
    pub env: BTreeMap<String, String>,
}

impl GuestRuntime {
    pub fn from_path(python: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            env: BTreeMap::new(),
        }
    }

    /// Locates `python3` (falling back to `python`) on `PATH`.
    pub fn from_system() -> Result<Self> {
        let path = std::env::var_os("PATH")
            .ok_or_else(|| anyhow!("PATH is not set; cannot locate a python interpreter"))?;
        find_interpreter(&path)
            .map(Self::from_path)
            .ok_or_else(|| anyhow!("no python interpreter found on PATH").into())
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }
}

fn find_interpreter(path: &std::ffi::OsStr) -> Option<PathBuf> {
    for name in ["python3", "python"] {
        for dir in std::env::split_paths(path) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overlay_accumulates() {
        let runtime = GuestRuntime::from_path("/usr/bin/python3")
            .with_env("PYTHONHASHSEED", "0")
            .with_env("APP_MODE", "test");
        assert_eq!(runtime.env.len(), 2);
        assert_eq!(runtime.env["APP_MODE"], "test");
    }

    #[test]
    fn interpreter_lookup_walks_path_entries() {
        let empty = tempfile::tempdir().unwrap();
        let with_python = tempfile::tempdir().unwrap();
        let fake = with_python.path().join("python3");
        std::fs::write(&fake, "#!/bin/sh\n").unwrap();

        let path =
            std::env::join_paths([empty.path(), with_python.path()]).unwrap();
        assert_eq!(find_interpreter(&path).unwrap(), fake);

        let path = std::env::join_paths([empty.path()]).unwrap();
        assert!(find_interpreter(&path).is_none());
    }
}
