//! Compile-from-source resolver: builds a cargo binary out of a module
//! directory. The cache key covers the target triple, the toolchain, and
//! every source/manifest file, so a source edit produces a new entry and
//! an unchanged tree is a guaranteed hit. Build failures are
//! deterministic and therefore not retried.

use std::process::Command as StdCommand;

use anyhow::Context;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{Output, Resolver};
use crate::cache::CacheKey;

const BIN_DIR: &str = "bin";

pub struct CargoBuildResolver {
    module_dir: Utf8PathBuf,
    bin_name: String,
    key: CacheKey,
}

impl CargoBuildResolver {
    /// Hash the module eagerly so that `cache_key` is cheap and stable
    /// for the lifetime of the resolver.
    pub fn prepare(module_dir: &Utf8Path, bin: Option<&str>) -> anyhow::Result<Self> {
        let module_dir = module_dir
            .canonicalize_utf8()
            .with_context(|| format!("module directory {module_dir} not found"))?;
        let bin_name = match bin {
            Some(name) => name.to_string(),
            None => module_dir
                .file_name()
                .context("module directory has no name")?
                .to_string(),
        };

        let mut hasher = Sha256::new();
        hasher.update(std::env::consts::OS.as_bytes());
        hasher.update(b"\0");
        hasher.update(std::env::consts::ARCH.as_bytes());
        hasher.update(b"\0");
        hasher.update(toolchain_version()?.as_bytes());
        hasher.update(b"\0");
        hasher.update(bin_name.as_bytes());
        hasher.update(b"\0");

        for rel_path in source_files(&module_dir)? {
            let contents = std::fs::read(module_dir.join(&rel_path))
                .with_context(|| format!("read {rel_path}"))?;
            hasher.update(rel_path.as_str().as_bytes());
            hasher.update(b"\0");
            hasher.update(&contents);
            hasher.update(b"\0");
        }

        Ok(CargoBuildResolver {
            module_dir,
            bin_name,
            key: CacheKey {
                family: "cargo",
                hash: hex::encode(hasher.finalize()),
            },
        })
    }

    fn binary_path(&self, output_dir: &Utf8Path) -> Utf8PathBuf {
        output_dir.join(BIN_DIR).join(&self.bin_name)
    }
}

fn toolchain_version() -> anyhow::Result<String> {
    let output = StdCommand::new("rustc")
        .arg("--version")
        .output()
        .context("run rustc --version")?;
    anyhow::ensure!(output.status.success(), "rustc --version failed");
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Sorted relative paths of everything that participates in the build
/// hash. A VCS listing is authoritative when available; otherwise walk
/// the tree, skipping build output and VCS internals.
fn source_files(module_dir: &Utf8Path) -> anyhow::Result<Vec<Utf8PathBuf>> {
    let git = StdCommand::new("git")
        .args(["-C", module_dir.as_str(), "ls-files", "--cached", "--others", "--exclude-standard"])
        .output();
    if let Ok(output) = git {
        if output.status.success() {
            let mut files: Vec<Utf8PathBuf> = String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter(|line| !line.is_empty())
                .map(Utf8PathBuf::from)
                .filter(|path| module_dir.join(path).is_file())
                .collect();
            files.sort();
            return Ok(files);
        }
    }

    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(module_dir).into_iter().filter_entry(|e| {
        let name = e.file_name().to_string_lossy();
        !(name == "target" || name == ".git")
    }) {
        let entry = entry?;
        if entry.file_type().is_file() {
            let path = Utf8PathBuf::from_path_buf(entry.into_path())
                .map_err(|p| anyhow::anyhow!("non-UTF8 path {p:?}"))?;
            files.push(
                path.strip_prefix(module_dir)
                    .expect("walked path outside module dir")
                    .to_owned(),
            );
        }
    }
    files.sort();
    Ok(files)
}

#[async_trait]
impl Resolver for CargoBuildResolver {
    fn cache_key(&self) -> CacheKey {
        self.key.clone()
    }

    async fn cached(&self, output_dir: &Utf8Path) -> anyhow::Result<Option<Output>> {
        let path = self.binary_path(output_dir);
        if path.is_file() {
            Ok(Some(Output {
                path: Some(path),
                meta: [("bin".to_string(), self.bin_name.clone())].into(),
            }))
        } else {
            Ok(None)
        }
    }

    async fn resolve(
        &self,
        cancel: &CancellationToken,
        output_dir: &Utf8Path,
    ) -> anyhow::Result<Output> {
        info!("building {} from {}", self.bin_name, self.module_dir);
        let target_dir = output_dir.join("target");

        let mut command = tokio::process::Command::new("cargo");
        command
            .args(["build", "--release", "--bin", &self.bin_name])
            .arg("--target-dir")
            .arg(target_dir.as_str())
            .current_dir(&self.module_dir)
            .kill_on_drop(true);

        let output = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("build of {} cancelled", self.bin_name),
            output = command.output() => output.context("spawn cargo build")?,
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // The interesting part of a cargo failure is at the end.
            let tail: String = stderr
                .lines()
                .rev()
                .take(30)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            anyhow::bail!("cargo build of {} failed:\n{tail}", self.bin_name);
        }

        let built = target_dir.join("release").join(&self.bin_name);
        anyhow::ensure!(built.is_file(), "cargo build produced no {built}");

        // Move the binary into a stable location inside the entry; the
        // copy goes through a temp name so `cached` never sees a torn
        // file.
        let final_path = self.binary_path(output_dir);
        std::fs::create_dir_all(output_dir.join(BIN_DIR))?;
        let tmp_path = final_path.with_extension("tmp");
        std::fs::copy(&built, &tmp_path).with_context(|| format!("copy {built}"))?;
        std::fs::rename(&tmp_path, &final_path)?;

        Ok(Output {
            path: Some(final_path),
            meta: [("bin".to_string(), self.bin_name.clone())].into(),
        })
    }

    fn retryable(&self) -> bool {
        false
    }
}
