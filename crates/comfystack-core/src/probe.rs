//! Environment prober: derives artifact status from what is on disk.
//!
//! Nothing here writes. Every status is recomputed on each run, which is
//! what makes interrupted runs resumable by simply running again.

use crate::catalog::ModelGroup;
use crate::error::{ProvisionError, Result};
use crate::fs::{LocalFs, PathInspector, PathKind};
use crate::layout::StackLayout;
use crate::manifest::{sha256_hex, Manifest};
use crate::request::ProvisioningRequest;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Durable results of provisioning stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Artifact {
    Environment,
    Manifest,
    Checkout,
    Requirements,
    Extension,
    Models(ModelGroup),
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::Environment => f.write_str("environment"),
            Artifact::Manifest => f.write_str("manifest"),
            Artifact::Checkout => f.write_str("checkout"),
            Artifact::Requirements => f.write_str("requirements"),
            Artifact::Extension => f.write_str("extension"),
            Artifact::Models(group) => write!(f, "models/{group}"),
        }
    }
}

/// Tri-state artifact status
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Absent,
    Valid,
    Stale,
}

/// One line of a probe summary.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProbeEntry {
    pub artifact: String,
    pub status: ArtifactStatus,
}

/// Snapshot of the target root for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    statuses: BTreeMap<Artifact, ArtifactStatus>,
    missing_assets: BTreeMap<ModelGroup, Vec<String>>,
    checkout_repository: bool,
    runtime: Option<PathBuf>,
    runtime_args: Vec<String>,
    git: Option<PathBuf>,
    ffmpeg: Option<PathBuf>,
}

impl ProbeResult {
    /// Status of `artifact`; anything not probed counts as absent.
    pub fn status(&self, artifact: Artifact) -> ArtifactStatus {
        self.statuses
            .get(&artifact)
            .copied()
            .unwrap_or(ArtifactStatus::Absent)
    }

    /// Repository paths of model files that still need downloading.
    pub fn missing_assets(&self, group: ModelGroup) -> &[String] {
        self.missing_assets
            .get(&group)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether the checkout is a git repository whose `HEAD` resolves to a
    /// commit. An initialised but empty repository does not count.
    pub fn checkout_is_repository(&self) -> bool {
        self.checkout_repository
    }

    /// Host interpreter used to create the environment.
    pub fn runtime(&self) -> Option<&Path> {
        self.runtime.as_deref()
    }

    /// Leading arguments for [`runtime`](Self::runtime), e.g. `-3.11` for `py`.
    pub fn runtime_args(&self) -> &[String] {
        &self.runtime_args
    }

    pub fn git(&self) -> Option<&Path> {
        self.git.as_deref()
    }

    pub fn ffmpeg(&self) -> Option<&Path> {
        self.ffmpeg.as_deref()
    }

    pub fn with_status(mut self, artifact: Artifact, status: ArtifactStatus) -> Self {
        self.statuses.insert(artifact, status);
        self
    }

    pub fn with_missing_assets(mut self, group: ModelGroup, files: Vec<String>) -> Self {
        self.missing_assets.insert(group, files);
        self
    }

    pub fn with_checkout_repository(mut self, yes: bool) -> Self {
        self.checkout_repository = yes;
        self
    }

    pub fn with_runtime(mut self, path: impl Into<PathBuf>) -> Self {
        self.runtime = Some(path.into());
        self
    }

    pub fn with_runtime_args(mut self, args: Vec<String>) -> Self {
        self.runtime_args = args;
        self
    }

    pub fn with_git(mut self, path: impl Into<PathBuf>) -> Self {
        self.git = Some(path.into());
        self
    }

    pub fn summary(&self) -> Vec<ProbeEntry> {
        self.statuses
            .iter()
            .map(|(artifact, status)| ProbeEntry {
                artifact: artifact.to_string(),
                status: *status,
            })
            .collect()
    }
}

/// Inspects a stack root through a [`PathInspector`].
pub struct Prober<'a> {
    fs: &'a dyn PathInspector,
}

impl<'a> Prober<'a> {
    pub fn new(fs: &'a dyn PathInspector) -> Self {
        Prober { fs }
    }

    /// Probe every artifact the request could touch.
    ///
    /// Fails with `Structural` when the root cannot be used, before any
    /// per-artifact status is computed.
    pub fn probe(&self, request: &ProvisioningRequest) -> Result<ProbeResult> {
        self.check_root(request.root())?;
        let layout = StackLayout::new(request.root());

        let (runtime, runtime_args) = match self.find_runtime(request.python()) {
            Some((path, args)) => (Some(path), args),
            None => (None, Vec::new()),
        };
        let mut result = ProbeResult {
            runtime,
            runtime_args,
            git: self.fs.find_program("git"),
            ffmpeg: self.fs.find_program("ffmpeg"),
            ..ProbeResult::default()
        };

        let manifest = match self.fs.kind(&layout.manifest()) {
            PathKind::File { .. } => self
                .fs
                .read_to_string(&layout.manifest())
                .ok()
                .map(|text| Manifest::parse(&text)),
            _ => None,
        };

        result.checkout_repository = self.head_resolves(&layout.app().join(".git"));
        let checkout = self.probe_checkout(&layout, result.checkout_repository);
        let statuses = [
            (Artifact::Environment, self.probe_environment(&layout)),
            (
                Artifact::Manifest,
                Self::manifest_status(manifest.as_ref(), request),
            ),
            (Artifact::Checkout, checkout),
            (
                Artifact::Requirements,
                self.probe_requirements(&layout, manifest.as_ref(), checkout),
            ),
            (Artifact::Extension, self.probe_extension(&layout)),
        ];
        for (artifact, status) in statuses {
            debug!(artifact = %artifact, status = ?status, "probed");
            result.statuses.insert(artifact, status);
        }

        if let Some(set) = request.models() {
            for group in ModelGroup::ALL {
                let missing: Vec<String> = set
                    .files(group)
                    .into_iter()
                    .filter(|f| !self.is_complete_file(&layout.model_file(group, f)))
                    .map(str::to_string)
                    .collect();
                let total = set.files(group).len();
                let status = if missing.is_empty() {
                    ArtifactStatus::Valid
                } else if missing.len() == total {
                    ArtifactStatus::Absent
                } else {
                    ArtifactStatus::Stale
                };
                debug!(group = %group, missing = missing.len(), "probed models");
                result.statuses.insert(Artifact::Models(group), status);
                result.missing_assets.insert(group, missing);
            }
        }

        Ok(result)
    }

    fn check_root(&self, root: &Path) -> Result<()> {
        let structural = |reason: &str| ProvisionError::Structural {
            path: root.to_path_buf(),
            reason: reason.to_string(),
        };
        match self.fs.kind(root) {
            PathKind::File { .. } => Err(structural("exists and is not a directory")),
            PathKind::Dir if !self.fs.is_writable(root) => Err(structural("not writable")),
            PathKind::Dir => Ok(()),
            PathKind::Missing => {
                // The root will be created; its nearest existing ancestor must allow it.
                let ancestor = root.ancestors().skip(1).find(|p| self.fs.exists(p));
                match ancestor {
                    Some(dir) if self.fs.is_dir(dir) && self.fs.is_writable(dir) => Ok(()),
                    Some(_) => Err(structural("parent directory is not writable")),
                    None => Err(structural("no existing parent directory")),
                }
            }
        }
    }

    /// Host interpreter plus leading arguments. A requested version goes
    /// through the `py` launcher on Windows and `python<version>` elsewhere.
    fn find_runtime(&self, version: Option<&str>) -> Option<(PathBuf, Vec<String>)> {
        match version {
            Some(v) if cfg!(windows) => self
                .fs
                .find_program("py")
                .map(|py| (py, vec![format!("-{v}")])),
            Some(v) => self
                .fs
                .find_program(&format!("python{v}"))
                .map(|p| (p, Vec::new())),
            None => {
                let candidates: &[&str] = if cfg!(windows) {
                    &["py", "python"]
                } else {
                    &["python3", "python"]
                };
                candidates
                    .iter()
                    .find_map(|name| self.fs.find_program(name))
                    .map(|p| (p, Vec::new()))
            }
        }
    }

    fn probe_environment(&self, layout: &StackLayout) -> ArtifactStatus {
        match self.fs.kind(&layout.venv()) {
            PathKind::Missing => ArtifactStatus::Absent,
            // venv writes the interpreter before ensurepip finishes
            PathKind::Dir
                if self.fs.exists(&layout.venv_python()) && self.fs.exists(&layout.venv_pip()) =>
            {
                ArtifactStatus::Valid
            }
            _ => ArtifactStatus::Stale,
        }
    }

    fn manifest_status(manifest: Option<&Manifest>, request: &ProvisioningRequest) -> ArtifactStatus {
        let Some(manifest) = manifest else {
            return ArtifactStatus::Absent;
        };
        let satisfied = match request.accelerator() {
            Some(acc) => manifest.satisfies(acc),
            None => manifest.torch_version().is_some(),
        };
        if satisfied {
            ArtifactStatus::Valid
        } else {
            ArtifactStatus::Stale
        }
    }

    fn probe_checkout(&self, layout: &StackLayout, repository: bool) -> ArtifactStatus {
        let app = layout.app();
        match self.fs.kind(&app) {
            PathKind::Missing => ArtifactStatus::Absent,
            PathKind::Dir
                if repository && self.fs.exists(&app.join(crate::layout::CHECKOUT_MARKER)) =>
            {
                ArtifactStatus::Valid
            }
            _ => ArtifactStatus::Stale,
        }
    }

    /// Whether `git_dir/HEAD` names a commit, directly or through a loose or
    /// packed ref. Read from disk so probing never runs git.
    fn head_resolves(&self, git_dir: &Path) -> bool {
        let Ok(head) = self.fs.read_to_string(&git_dir.join("HEAD")) else {
            return false;
        };
        let head = head.trim();
        let Some(target) = head.strip_prefix("ref:").map(str::trim) else {
            return is_object_id(head);
        };
        if let Ok(loose) = self.fs.read_to_string(&git_dir.join(target)) {
            return is_object_id(loose.trim());
        }
        self.fs
            .read_to_string(&git_dir.join("packed-refs"))
            .map(|packed| {
                packed.lines().any(|line| {
                    line.split_once(' ')
                        .is_some_and(|(id, name)| name == target && is_object_id(id))
                })
            })
            .unwrap_or(false)
    }

    fn probe_requirements(
        &self,
        layout: &StackLayout,
        manifest: Option<&Manifest>,
        checkout: ArtifactStatus,
    ) -> ArtifactStatus {
        if checkout != ArtifactStatus::Valid {
            return ArtifactStatus::Absent;
        }
        let Some(recorded) = manifest.and_then(|m| m.requirements_sha256.as_deref()) else {
            return ArtifactStatus::Absent;
        };
        match self.fs.read(&layout.requirements()) {
            Ok(bytes) if sha256_hex(&bytes) == recorded => ArtifactStatus::Valid,
            Ok(_) => ArtifactStatus::Stale,
            Err(_) => ArtifactStatus::Absent,
        }
    }

    fn probe_extension(&self, layout: &StackLayout) -> ArtifactStatus {
        let ext = layout.extension();
        match self.fs.kind(&ext) {
            PathKind::Missing => ArtifactStatus::Absent,
            PathKind::Dir if self.fs.exists(&ext.join(".git")) => ArtifactStatus::Valid,
            _ => ArtifactStatus::Stale,
        }
    }

    fn is_complete_file(&self, path: &Path) -> bool {
        matches!(self.fs.kind(path), PathKind::File { len } if len > 0)
    }
}

fn is_object_id(value: &str) -> bool {
    matches!(value.len(), 40 | 64) && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Probe against the local filesystem.
pub fn probe(request: &ProvisioningRequest) -> Result<ProbeResult> {
    Prober::new(&LocalFs).probe(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Accelerator, ModelSet};
    use crate::fakes::HostToolsFs;
    use crate::request::Operation;
    use tempfile::tempdir;

    fn install_request(root: &Path) -> ProvisioningRequest {
        ProvisioningRequest::builder(Operation::Install, root)
            .accelerator("cu121")
            .models("5b")
            .build()
            .unwrap()
    }

    fn touch(path: &Path, contents: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    const COMMIT: &str = "4f5e2c7d9a1b3c5e7f9a1b3c5d7e9f1a3b5c7d9e";

    /// Repository on `main` with one commit.
    fn init_repo(dir: &Path) {
        touch(&dir.join(".git/HEAD"), b"ref: refs/heads/main\n");
        touch(&dir.join(".git/refs/heads/main"), format!("{COMMIT}\n").as_bytes());
    }

    #[test]
    fn test_fresh_root_all_absent() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("stack");
        let result = probe(&install_request(&root)).unwrap();
        for artifact in [
            Artifact::Environment,
            Artifact::Manifest,
            Artifact::Checkout,
            Artifact::Requirements,
            Artifact::Extension,
            Artifact::Models(ModelGroup::Diffusion),
        ] {
            assert_eq!(result.status(artifact), ArtifactStatus::Absent, "{artifact}");
        }
        assert_eq!(result.missing_assets(ModelGroup::Vae).len(), 2);
    }

    #[test]
    fn test_root_is_file_is_structural() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("file");
        touch(&root, b"x");
        let err = probe(&install_request(&root)).unwrap_err();
        assert!(matches!(err, ProvisionError::Structural { .. }));
        assert_eq!(err.exit_code(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_readonly_root_is_structural() {
        use std::os::unix::fs::PermissionsExt;
        if nix::unistd::Uid::effective().is_root() {
            return;
        }
        let dir = tempdir().unwrap();
        let root = dir.path().join("ro");
        std::fs::create_dir(&root).unwrap();
        std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o555)).unwrap();
        let result = probe(&install_request(&root));
        std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(matches!(result, Err(ProvisionError::Structural { .. })));
    }

    /// `/` is owned by root with mode 0755: its write bits are set, but not
    /// for anyone else.
    #[cfg(unix)]
    #[test]
    fn test_root_owned_parent_is_structural_for_other_users() {
        if nix::unistd::Uid::effective().is_root() {
            return;
        }
        let req = install_request(Path::new("/comfystack-not-creatable"));
        let err = probe(&req).unwrap_err();
        assert!(matches!(err, ProvisionError::Structural { .. }));
        assert!(err.to_string().contains("not writable"));
    }

    #[test]
    fn test_environment_valid_and_stale() {
        let dir = tempdir().unwrap();
        let layout = StackLayout::new(dir.path());
        std::fs::create_dir_all(layout.venv()).unwrap();
        let req = install_request(dir.path());
        assert_eq!(
            probe(&req).unwrap().status(Artifact::Environment),
            ArtifactStatus::Stale
        );
        touch(&layout.venv_python(), b"");
        touch(&layout.venv_pip(), b"");
        assert_eq!(
            probe(&req).unwrap().status(Artifact::Environment),
            ArtifactStatus::Valid
        );
    }

    #[test]
    fn test_environment_without_pip_is_stale() {
        let dir = tempdir().unwrap();
        let layout = StackLayout::new(dir.path());
        // interrupted during ensurepip
        touch(&layout.venv_python(), b"");
        touch(&layout.venv().join("pyvenv.cfg"), b"home = /usr/bin\n");
        let result = probe(&install_request(dir.path())).unwrap();
        assert_eq!(result.status(Artifact::Environment), ArtifactStatus::Stale);
    }

    #[test]
    fn test_manifest_for_other_accelerator_is_stale() {
        let dir = tempdir().unwrap();
        let layout = StackLayout::new(dir.path());
        let manifest = Manifest::new(Accelerator::Cu118, None, "torch==2.3.1+cu118\n");
        touch(&layout.manifest(), manifest.render().as_bytes());
        let result = probe(&install_request(dir.path())).unwrap();
        assert_eq!(result.status(Artifact::Manifest), ArtifactStatus::Stale);
    }

    #[test]
    fn test_checkout_and_requirements() {
        let dir = tempdir().unwrap();
        let layout = StackLayout::new(dir.path());
        init_repo(&layout.app());
        touch(&layout.app().join("main.py"), b"print()");
        touch(&layout.requirements(), b"numpy\n");

        let req = install_request(dir.path());
        let result = probe(&req).unwrap();
        assert_eq!(result.status(Artifact::Checkout), ArtifactStatus::Valid);
        assert_eq!(result.status(Artifact::Requirements), ArtifactStatus::Absent);

        let manifest = Manifest::new(
            Accelerator::Cu121,
            Some(sha256_hex(b"numpy\n")),
            "torch==2.3.1+cu121\n",
        );
        touch(&layout.manifest(), manifest.render().as_bytes());
        let result = probe(&req).unwrap();
        assert_eq!(result.status(Artifact::Manifest), ArtifactStatus::Valid);
        assert_eq!(result.status(Artifact::Requirements), ArtifactStatus::Valid);

        touch(&layout.requirements(), b"numpy\nscipy\n");
        let result = probe(&req).unwrap();
        assert_eq!(result.status(Artifact::Requirements), ArtifactStatus::Stale);
    }

    #[test]
    fn test_checkout_without_git_is_stale() {
        let dir = tempdir().unwrap();
        let layout = StackLayout::new(dir.path());
        touch(&layout.app().join("main.py"), b"");
        let result = probe(&install_request(dir.path())).unwrap();
        assert_eq!(result.status(Artifact::Checkout), ArtifactStatus::Stale);
        assert!(!result.checkout_is_repository());
    }

    #[test]
    fn test_empty_repository_is_not_adoptable_as_is() {
        let dir = tempdir().unwrap();
        let layout = StackLayout::new(dir.path());
        // `git init` leaves HEAD pointing at a branch with no commits
        touch(&layout.app().join(".git/HEAD"), b"ref: refs/heads/master\n");
        std::fs::create_dir_all(layout.app().join(".git/refs/heads")).unwrap();
        touch(&layout.app().join("main.py"), b"");

        let result = probe(&install_request(dir.path())).unwrap();
        assert!(!result.checkout_is_repository());
        assert_eq!(result.status(Artifact::Checkout), ArtifactStatus::Stale);
    }

    #[test]
    fn test_packed_and_detached_heads_resolve() {
        let dir = tempdir().unwrap();
        let layout = StackLayout::new(dir.path());
        let git = layout.app().join(".git");
        touch(&layout.app().join("main.py"), b"");
        touch(&git.join("HEAD"), b"ref: refs/heads/master\n");
        touch(
            &git.join("packed-refs"),
            format!("# pack-refs with: peeled fully-peeled sorted\n{COMMIT} refs/heads/master\n")
                .as_bytes(),
        );
        let req = install_request(dir.path());
        assert_eq!(probe(&req).unwrap().status(Artifact::Checkout), ArtifactStatus::Valid);

        touch(&git.join("HEAD"), format!("{COMMIT}\n").as_bytes());
        std::fs::remove_file(git.join("packed-refs")).unwrap();
        assert!(probe(&req).unwrap().checkout_is_repository());
    }

    #[test]
    fn test_requested_python_version_selects_interpreter() {
        let dir = tempdir().unwrap();
        let fs = HostToolsFs::with_defaults().with_program(
            if cfg!(windows) { "py" } else { "python3.11" },
            "/opt/python3.11",
        );
        let req = ProvisioningRequest::builder(Operation::Install, dir.path())
            .accelerator("cpu")
            .python("3.11")
            .build()
            .unwrap();
        let result = Prober::new(&fs).probe(&req).unwrap();
        assert_eq!(result.runtime(), Some(Path::new("/opt/python3.11")));
        if cfg!(windows) {
            assert_eq!(result.runtime_args(), &["-3.11".to_string()]);
        } else {
            assert!(result.runtime_args().is_empty());
        }

        let missing = ProvisioningRequest::builder(Operation::Install, dir.path())
            .accelerator("cpu")
            .python("3.9")
            .build()
            .unwrap();
        let fs = HostToolsFs::with_defaults();
        assert!(Prober::new(&fs).probe(&missing).unwrap().runtime().is_none());
    }

    #[test]
    fn test_partial_models_are_stale() {
        let dir = tempdir().unwrap();
        let layout = StackLayout::new(dir.path());
        let vae = ModelSet::Ti2v5b.files(ModelGroup::Vae);
        touch(&layout.model_file(ModelGroup::Vae, vae[0]), b"weights");
        // zero-length files do not count
        touch(&layout.model_file(ModelGroup::Vae, vae[1]), b"");

        let result = probe(&install_request(dir.path())).unwrap();
        assert_eq!(
            result.status(Artifact::Models(ModelGroup::Vae)),
            ArtifactStatus::Stale
        );
        assert_eq!(result.missing_assets(ModelGroup::Vae), &[vae[1].to_string()]);
    }

    #[test]
    fn test_models_not_probed_without_selection() {
        let dir = tempdir().unwrap();
        let req = ProvisioningRequest::builder(Operation::Install, dir.path())
            .accelerator("cpu")
            .build()
            .unwrap();
        let result = probe(&req).unwrap();
        assert!(result
            .summary()
            .iter()
            .all(|entry| !entry.artifact.starts_with("models/")));
    }

    #[test]
    fn test_probe_does_not_create_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("later");
        probe(&install_request(&root)).unwrap();
        assert!(!root.exists());
    }
}
