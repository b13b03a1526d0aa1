//! Dependency manifest: a small header followed by `pip freeze` output.
//!
//! ```text
//! # accelerator: cu121
//! # requirements-sha256: 9f2c...
//! torch==2.3.1+cu121
//! ...
//! ```
//!
//! The prober derives dependency and requirements status from this file
//! alone, so it is always replaced atomically.

use crate::catalog::Accelerator;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;

const ACCELERATOR_KEY: &str = "# accelerator:";
const REQUIREMENTS_KEY: &str = "# requirements-sha256:";

/// Parsed manifest contents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub accelerator: Option<String>,
    pub requirements_sha256: Option<String>,
    pub packages: Vec<String>,
}

impl Manifest {
    pub fn new(
        accelerator: Accelerator,
        requirements_sha256: Option<String>,
        freeze_output: &str,
    ) -> Self {
        Manifest {
            accelerator: Some(accelerator.name().to_string()),
            requirements_sha256,
            packages: freeze_output
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut manifest = Manifest::default();
        for line in text.lines().map(str::trim) {
            if let Some(value) = line.strip_prefix(ACCELERATOR_KEY) {
                manifest.accelerator = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix(REQUIREMENTS_KEY) {
                manifest.requirements_sha256 = Some(value.trim().to_string());
            } else if !line.is_empty() && !line.starts_with('#') {
                manifest.packages.push(line.to_string());
            }
        }
        manifest
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(acc) = &self.accelerator {
            out.push_str(&format!("{ACCELERATOR_KEY} {acc}\n"));
        }
        if let Some(sha) = &self.requirements_sha256 {
            out.push_str(&format!("{REQUIREMENTS_KEY} {sha}\n"));
        }
        for pkg in &self.packages {
            out.push_str(pkg);
            out.push('\n');
        }
        out
    }

    /// Pinned torch version, if any.
    pub fn torch_version(&self) -> Option<&str> {
        self.packages
            .iter()
            .find_map(|p| p.strip_prefix("torch=="))
            .map(str::trim)
    }

    /// Whether the manifest was produced for `accelerator` and pins a
    /// matching torch build.
    pub fn satisfies(&self, accelerator: Accelerator) -> bool {
        if self.accelerator.as_deref() != Some(accelerator.name()) {
            return false;
        }
        match self.torch_version() {
            None => false,
            // CPU wheels on some platforms carry no local version suffix.
            Some(v) if accelerator == Accelerator::Cpu => {
                v.ends_with(&accelerator.torch_suffix()) || !v.contains('+')
            }
            Some(v) => v.ends_with(&accelerator.torch_suffix()),
        }
    }
}

/// Hex sha256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `contents` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const FREEZE: &str = "filelock==3.13.1\ntorch==2.3.1+cu121\ntorchvision==0.18.1+cu121\n";

    #[test]
    fn test_render_then_parse() {
        let manifest = Manifest::new(Accelerator::Cu121, Some("abc".into()), FREEZE);
        let parsed = Manifest::parse(&manifest.render());
        assert_eq!(parsed, manifest);
        assert_eq!(parsed.torch_version(), Some("2.3.1+cu121"));
    }

    #[test]
    fn test_satisfies_matching_accelerator() {
        let manifest = Manifest::new(Accelerator::Cu121, None, FREEZE);
        assert!(manifest.satisfies(Accelerator::Cu121));
        assert!(!manifest.satisfies(Accelerator::Cu118));
    }

    #[test]
    fn test_header_mismatch_is_not_satisfied() {
        let mut manifest = Manifest::new(Accelerator::Cu121, None, FREEZE);
        manifest.accelerator = Some("cu118".into());
        assert!(!manifest.satisfies(Accelerator::Cu118));
    }

    #[test]
    fn test_cpu_accepts_unsuffixed_torch() {
        let manifest = Manifest::new(Accelerator::Cpu, None, "torch==2.3.1\n");
        assert!(manifest.satisfies(Accelerator::Cpu));
        let suffixed = Manifest::new(Accelerator::Cpu, None, "torch==2.3.1+cpu\n");
        assert!(suffixed.satisfies(Accelerator::Cpu));
        let cuda = Manifest::new(Accelerator::Cpu, None, "torch==2.3.1+cu118\n");
        assert!(!cuda.satisfies(Accelerator::Cpu));
    }

    #[test]
    fn test_missing_torch_not_satisfied() {
        let manifest = Manifest::new(Accelerator::Cpu, None, "numpy==1.26.0\n");
        assert!(!manifest.satisfies(Accelerator::Cpu));
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(sha256_hex(b"").len(), 64);
        assert_ne!(sha256_hex(b"a"), sha256_hex(b"b"));
    }

    #[test]
    fn test_write_atomic_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("m.txt");
        write_atomic(&path, "one").unwrap();
        write_atomic(&path, "two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
    }
}
