//! Python interpreter tree - paths, package enumeration, integrity

mod packages;
mod runner;

pub use packages::PackageManager;
pub use runner::{argument_text, ScriptRunner};

use crate::config::Config;
use crate::protocol::{crypto, OperationKind};
use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Expected SHA-256 of the bundled interpreter, XOR-obfuscated with
/// [`HASH_OBFUSCATION_SALT`]. Empty disables the integrity check.
const OBFUSCATED_INTERPRETER_HASH: &str = "";
const HASH_OBFUSCATION_SALT: &str = "s0m3S@ltV@lu3";

/// Outcome of one supervised Python child process.
#[derive(Debug, Clone, Default)]
pub struct PythonResult {
    pub execution_id: String,
    pub success: bool,
    pub cancelled: bool,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: i64,
    pub error_code: Option<i64>,
    /// Human-readable summary for operations that short-circuit (e.g.
    /// install of an already-installed package)
    pub message: Option<String>,
    /// Package names matched by a search operation
    pub results: Option<Vec<String>>,
}

impl PythonResult {
    /// Terminal status string for this result.
    pub fn status(&self) -> &'static str {
        if self.cancelled {
            "cancelled"
        } else if self.success {
            "success"
        } else {
            "error"
        }
    }
}

/// Events emitted by the subprocess supervisor toward the broker loop.
#[derive(Debug)]
pub enum EngineEvent {
    /// Streamed stage description while a child is running
    Progress {
        execution_id: String,
        kind: OperationKind,
        stage: String,
    },
    /// Terminal result of a script or syntax-check execution
    ScriptFinished {
        execution_id: String,
        result: PythonResult,
    },
    /// Terminal result of a package operation
    PackageFinished {
        execution_id: String,
        kind: OperationKind,
        result: PythonResult,
    },
}

/// The embedded Python installation the broker drives.
///
/// Children run with `PYTHONHOME`/`PYTHONPATH` pointing into this tree and
/// the tree root as working directory. Third-party packages are installed
/// into (and enumerated from) its site directory.
#[derive(Debug, Clone)]
pub struct PythonEnv {
    home: PathBuf,
    site_packages: PathBuf,
    python_exe: PathBuf,
}

impl PythonEnv {
    /// Environment rooted at `home`, using the bundled interpreter.
    pub fn new(home: PathBuf) -> Self {
        let python_exe = if cfg!(windows) {
            home.join("python.exe")
        } else {
            home.join("bin").join("python3")
        };
        Self::with_interpreter(home, python_exe)
    }

    /// Environment rooted at `home` with an explicit interpreter.
    pub fn with_interpreter(home: PathBuf, python_exe: PathBuf) -> Self {
        let site_packages = home.join("Lib").join("site-packages");
        Self {
            home,
            site_packages,
            python_exe,
        }
    }

    /// Resolve the environment from configuration, defaulting to the
    /// `python/` tree next to the running executable. When the bundled
    /// interpreter is absent, fall back to `python3` from PATH so the broker
    /// stays usable on development hosts.
    pub fn discover(config: &Config) -> Result<Self> {
        let home = match &config.general.python_home {
            Some(home) => home.clone(),
            None => {
                let exe = std::env::current_exe().context("Failed to locate own executable")?;
                exe.parent()
                    .map(|dir| dir.join("python"))
                    .context("Executable has no parent directory")?
            }
        };

        let mut env = match &config.general.python_executable {
            Some(exe) => Self::with_interpreter(home, exe.clone()),
            None => Self::new(home),
        };

        if !env.python_exe.exists() {
            tracing::warn!(
                "Bundled interpreter not found at {:?}, falling back to python3 from PATH",
                env.python_exe
            );
            env.python_exe = PathBuf::from("python3");
        }

        std::fs::create_dir_all(&env.site_packages)
            .with_context(|| format!("Failed to create site directory {:?}", env.site_packages))?;

        Ok(env)
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Target directory for third-party packages.
    pub fn site_packages(&self) -> &Path {
        &self.site_packages
    }

    pub fn python_executable(&self) -> &Path {
        &self.python_exe
    }

    /// Whether the interpreter lives inside the bundled tree (as opposed to
    /// a PATH fallback, which must not see `PYTHONHOME`).
    fn interpreter_is_bundled(&self) -> bool {
        self.python_exe.starts_with(&self.home)
    }

    /// A preconfigured interpreter invocation: environment, working
    /// directory, and no inherited stdin.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.python_exe);
        cmd.current_dir(&self.home);
        cmd.env("PYTHONPATH", &self.site_packages);
        if self.interpreter_is_bundled() {
            cmd.env("PYTHONHOME", &self.home);
        }
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Enumerate installed packages by scanning the site directory for
    /// `*.dist-info` and `*.egg-info` entries. Names are deduplicated
    /// case-insensitively; first occurrence wins and scan order (sorted by
    /// file name) is preserved.
    pub fn list_installed_packages(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut seen = HashSet::new();

        for entry in self.metadata_entries() {
            let (name, _version) = split_name_version(&entry);
            if seen.insert(normalize_name(&name)) {
                names.push(name);
            }
        }
        names
    }

    /// Installed version of `package` from its metadata directory name.
    pub fn package_version(&self, package: &str) -> Option<String> {
        let wanted = normalize_name(package);
        for entry in self.metadata_entries() {
            let (name, version) = split_name_version(&entry);
            if normalize_name(&name) == wanted {
                return version;
            }
        }
        None
    }

    /// Whether `package` has metadata in the site directory.
    pub fn is_package_installed(&self, package: &str) -> bool {
        let wanted = normalize_name(package);
        self.metadata_entries()
            .iter()
            .any(|entry| normalize_name(&split_name_version(entry).0) == wanted)
    }

    /// Remove a package's directory and metadata from the site directory.
    /// Returns the paths that were deleted.
    pub fn remove_package(&self, package: &str) -> std::io::Result<Vec<PathBuf>> {
        let wanted = normalize_name(package);
        let mut removed = Vec::new();

        let entries = match std::fs::read_dir(&self.site_packages) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(e) => return Err(e),
        };

        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().into_owned();

            let matches = if let Some(stem) = metadata_stem(&file_name) {
                normalize_name(&split_name_version(&stem.to_string()).0) == wanted
            } else {
                normalize_name(&file_name) == wanted
            };

            if matches {
                let path = entry.path();
                if path.is_dir() {
                    std::fs::remove_dir_all(&path)?;
                } else {
                    std::fs::remove_file(&path)?;
                }
                removed.push(path);
            }
        }
        Ok(removed)
    }

    /// Package metadata from `pip show`, parsed into a JSON object.
    pub async fn package_info(
        &self,
        package: &str,
    ) -> Result<serde_json::Map<String, Value>> {
        let output = self
            .command()
            .args(["-m", "pip", "show", package])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run pip show")?;

        if !output.status.success() {
            bail!(
                "pip show failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut info = serde_json::Map::new();
        for line in stdout.lines() {
            if let Some((key, value)) = line.split_once(':') {
                info.insert(
                    key.trim().to_string(),
                    Value::String(value.trim().to_string()),
                );
            }
        }

        if info.is_empty() {
            bail!("pip show produced no metadata for '{package}'");
        }
        Ok(info)
    }

    /// Verify the interpreter binary against the compiled-in expected hash.
    /// A no-op when no hash was compiled in. Hashing runs off the event loop.
    pub async fn verify_executable(&self) -> Result<()> {
        let Some(expected) = expected_interpreter_hash() else {
            return Ok(());
        };

        let path = self.python_exe.clone();
        let computed = tokio::task::spawn_blocking(move || crypto::sha256_file(&path))
            .await
            .context("Hash task failed")?
            .context("Failed to hash Python interpreter")?;

        if computed != expected {
            bail!("Python interpreter hash mismatch");
        }
        Ok(())
    }

    /// Sorted `*.dist-info` / `*.egg-info` stems from the site directory.
    fn metadata_entries(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.site_packages) else {
            return Vec::new();
        };

        let mut stems: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                metadata_stem(&name).map(str::to_string)
            })
            .collect();
        stems.sort();
        stems
    }
}

/// Strip a `.dist-info` / `.egg-info` suffix, or `None` for other entries.
fn metadata_stem(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(".dist-info")
        .or_else(|| file_name.strip_suffix(".egg-info"))
}

/// Split `name-1.2.3` into name and version; the version segment must start
/// with a digit, so names containing dashes survive intact.
fn split_name_version(stem: &str) -> (String, Option<String>) {
    if let Some((name, version)) = stem.rsplit_once('-') {
        if version.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            return (name.to_string(), Some(version.to_string()));
        }
    }
    (stem.to_string(), None)
}

/// Case-insensitive comparison key; pip treats `-` and `_` as equivalent.
fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace('-', "_")
}

fn expected_interpreter_hash() -> Option<String> {
    if OBFUSCATED_INTERPRETER_HASH.is_empty() {
        return None;
    }
    let obfuscated = hex::decode(OBFUSCATED_INTERPRETER_HASH).ok()?;
    let salt = HASH_OBFUSCATION_SALT.as_bytes();
    let deobfuscated: Vec<u8> = obfuscated
        .iter()
        .enumerate()
        .map(|(i, byte)| byte ^ salt[i % salt.len()])
        .collect();
    Some(hex::encode(deobfuscated))
}
