//! Paths of every artifact below the target root.

use crate::catalog::{file_name, ModelGroup};
use std::path::{Path, PathBuf};

pub const APP_DIR: &str = "ComfyUI";
pub const VENV_DIR: &str = ".venv";
pub const MANIFEST_FILE: &str = "comfystack-manifest.txt";
pub const EXTENSION_DIR: &str = "ComfyUI-Manager";
pub const LAUNCH_LOG: &str = "comfyui.log";

/// File whose presence marks a usable checkout.
pub const CHECKOUT_MARKER: &str = "main.py";
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Resolved layout of a stack root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackLayout {
    root: PathBuf,
}

impl StackLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StackLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn venv(&self) -> PathBuf {
        self.root.join(VENV_DIR)
    }

    /// Interpreter inside the isolated environment.
    pub fn venv_python(&self) -> PathBuf {
        if cfg!(windows) {
            self.venv().join("Scripts").join("python.exe")
        } else {
            self.venv().join("bin").join("python")
        }
    }

    /// pip entry point, written last by `ensurepip`.
    pub fn venv_pip(&self) -> PathBuf {
        if cfg!(windows) {
            self.venv().join("Scripts").join("pip.exe")
        } else {
            self.venv().join("bin").join("pip")
        }
    }

    /// Shell hint for activating the environment.
    pub fn activate_hint(&self) -> String {
        if cfg!(windows) {
            self.venv()
                .join("Scripts")
                .join("Activate.ps1")
                .display()
                .to_string()
        } else {
            format!("source {}", self.venv().join("bin").join("activate").display())
        }
    }

    pub fn manifest(&self) -> PathBuf {
        self.venv().join(MANIFEST_FILE)
    }

    pub fn app(&self) -> PathBuf {
        self.root.join(APP_DIR)
    }

    pub fn requirements(&self) -> PathBuf {
        self.app().join(REQUIREMENTS_FILE)
    }

    pub fn extension(&self) -> PathBuf {
        self.app().join("custom_nodes").join(EXTENSION_DIR)
    }

    pub fn model_dir(&self, group: ModelGroup) -> PathBuf {
        self.app().join("models").join(group.dir_name())
    }

    /// Local destination of a repository-relative model file.
    pub fn model_file(&self, group: ModelGroup, repo_path: &str) -> PathBuf {
        self.model_dir(group).join(file_name(repo_path))
    }

    pub fn launch_log(&self) -> PathBuf {
        self.root.join(LAUNCH_LOG)
    }
}
