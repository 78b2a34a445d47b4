use std::collections::BTreeMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// A single guest source file, carried base64-encoded so the bundle stays
/// printable JSON regardless of source contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceModule {
    /// Import name, e.g. `utils`.
    pub name: String,
    /// Virtual path used by the guest for `__file__` and tracebacks.
    pub path: String,
    /// Base64-encoded source text.
    pub source: String,
}

impl SourceModule {
    pub fn from_source(name: &str, virtual_path: &str, source: &str) -> Self {
        Self {
            name: name.to_string(),
            path: virtual_path.to_string(),
            source: BASE64.encode(source),
        }
    }

    /// Reads a source file from disk; the on-disk path becomes the virtual
    /// path.
    pub fn from_file(name: &str, path: &Path) -> Result<Self> {
        let source = std::fs::read(path)?;
        Ok(Self {
            name: name.to_string(),
            path: path.display().to_string(),
            source: BASE64.encode(source),
        })
    }

    pub fn decode_source(&self) -> Result<String> {
        let bytes = BASE64
            .decode(&self.source)
            .map_err(|err| BridgeError::Framing(format!("invalid module source base64: {err}")))?;
        String::from_utf8(bytes)
            .map_err(|err| BridgeError::Framing(format!("module source is not UTF-8: {err}")))
    }
}

/// A guest package: a directory of modules plus nested subpackages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcePackage {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub modules: Vec<SourceModule>,
    #[serde(default)]
    pub packages: Vec<SourcePackage>,
}

impl SourcePackage {
    pub fn new(name: &str, path: &str, modules: Vec<SourceModule>) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            modules,
            packages: Vec::new(),
        }
    }

    /// Recursively loads every `.py` file under `root` into a package tree.
    /// Non-Python files are skipped; subdirectories become subpackages.
    pub fn from_dir(name: &str, root: &Path) -> Result<Self> {
        let mut package = SourcePackage {
            name: name.to_string(),
            path: root.display().to_string(),
            ..Default::default()
        };

        let mut entries: Vec<_> =
            std::fs::read_dir(root)?.collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() {
                package
                    .packages
                    .push(SourcePackage::from_dir(&file_name, &path)?);
            } else if path.extension().is_some_and(|ext| ext == "py") {
                package
                    .modules
                    .push(SourceModule::from_file(&file_name, &path)?);
            }
        }
        Ok(package)
    }
}

/// Child-side descriptor numbers for the three runtime pipes, as seen by the
/// guest. Populated by the launcher just before serialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Wiring {
    /// Guest reads host commands here.
    pub pipe_in: i32,
    /// Guest writes data to the host here.
    pub pipe_out: i32,
    /// Guest writes status and exception records here.
    pub status: i32,
}

/// The complete program payload delivered to the guest on the program pipe.
///
/// Immutable after launch. The core treats the sources as opaque blobs; the
/// guest-side loader decodes and installs them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeBundle {
    /// Program identity, for logging on both sides.
    pub name: String,
    /// Base path for resolving relative imports.
    pub path: String,
    /// The `__main__` module.
    pub entrypoint: SourceModule,
    #[serde(default)]
    pub packages: Vec<SourcePackage>,
    #[serde(default)]
    pub modules: Vec<SourceModule>,
    /// Key-value data surfaced to guest code.
    #[serde(default)]
    pub kv_pairs: BTreeMap<String, serde_json::Value>,
    /// When set, the guest starts its debug server on this port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_port: Option<u16>,
    #[serde(default)]
    pub break_on_start: bool,
    #[serde(default)]
    pub wiring: Wiring,
}

impl CodeBundle {
    pub fn new(name: &str, path: &str, entrypoint: SourceModule) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            entrypoint,
            packages: Vec::new(),
            modules: Vec::new(),
            kv_pairs: BTreeMap::new(),
            debug_port: None,
            break_on_start: false,
            wiring: Wiring::default(),
        }
    }

    pub fn with_module(mut self, module: SourceModule) -> Self {
        self.modules.push(module);
        self
    }

    pub fn with_package(mut self, package: SourcePackage) -> Self {
        self.packages.push(package);
        self
    }

    pub fn with_kv(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.kv_pairs.insert(key.to_string(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_source_round_trips_through_base64() {
        let module = SourceModule::from_source("m", "pkg/m.py", "print('hi')\n");
        assert_ne!(module.source, "print('hi')\n");
        assert_eq!(module.decode_source().unwrap(), "print('hi')\n");
    }

    #[test]
    fn from_dir_builds_a_nested_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("__init__.py"), "").unwrap();
        std::fs::write(dir.path().join("a.py"), "A = 1\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("__init__.py"), "").unwrap();
        std::fs::write(sub.join("b.py"), "B = 2\n").unwrap();

        let package = SourcePackage::from_dir("top", dir.path()).unwrap();
        let module_names: Vec<_> = package.modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(module_names, ["__init__.py", "a.py"]);
        assert_eq!(package.packages.len(), 1);
        assert_eq!(package.packages[0].name, "sub");
        assert_eq!(package.packages[0].modules.len(), 2);
        assert_eq!(
            package.packages[0].modules[1].decode_source().unwrap(),
            "B = 2\n"
        );
    }

    #[test]
    fn bundle_serializes_with_wiring() {
        let mut bundle = CodeBundle::new(
            "demo",
            "/srv/demo",
            SourceModule::from_source("__main__", "/srv/demo/main.py", "pass\n"),
        )
        .with_kv("threshold", 3);
        bundle.wiring = Wiring {
            pipe_in: 4,
            pipe_out: 3,
            status: 5,
        };

        let json: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&bundle).unwrap()).unwrap();
        assert_eq!(json["wiring"]["pipe_out"], 3);
        assert_eq!(json["kv_pairs"]["threshold"], 3);
        assert_eq!(json["entrypoint"]["name"], "__main__");
        assert!(json.get("debug_port").is_none());
    }
}
