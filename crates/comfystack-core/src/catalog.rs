//! Accelerator builds, model sets and the files that make them up.

use crate::error::ProvisionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hugging Face repository holding the repackaged Wan 2.2 files.
pub const WAN_REPO: &str = "Comfy-Org/Wan_2.2_ComfyUI_Repackaged";

/// Application repository.
pub const COMFY_REPO_URL: &str = "https://github.com/comfyanonymous/ComfyUI.git";

/// Optional extension repository.
pub const MANAGER_REPO_URL: &str = "https://github.com/Comfy-Org/ComfyUI-Manager.git";

const DIFFUSION_5B: &[&str] = &["split_files/diffusion_models/wan2.2_ti2v_5B_fp16.safetensors"];

const DIFFUSION_14B: &[&str] = &[
    "split_files/diffusion_models/wan2.2_t2v_high_noise_14B_fp8_scaled.safetensors",
    "split_files/diffusion_models/wan2.2_t2v_low_noise_14B_fp8_scaled.safetensors",
];

const DIFFUSION_I2V: &[&str] = &[
    "split_files/diffusion_models/wan2.2_i2v_high_noise_14B_fp8_scaled.safetensors",
    "split_files/diffusion_models/wan2.2_i2v_low_noise_14B_fp8_scaled.safetensors",
];

const VAE_FILES: &[&str] = &[
    "split_files/vae/wan_2.1_vae.safetensors",
    "split_files/vae/wan2.2_vae.safetensors",
];

const TEXT_ENCODERS: &[&str] = &["split_files/text_encoders/umt5_xxl_fp8_e4m3fn_scaled.safetensors"];

/// Torch build to install into the environment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Accelerator {
    Cpu,
    Cu118,
    Cu121,
}

impl Accelerator {
    pub const ALL: [Accelerator; 3] = [Accelerator::Cpu, Accelerator::Cu118, Accelerator::Cu121];

    pub fn name(&self) -> &'static str {
        match self {
            Accelerator::Cpu => "cpu",
            Accelerator::Cu118 => "cu118",
            Accelerator::Cu121 => "cu121",
        }
    }

    /// Wheel index torch is installed from.
    pub fn index_url(&self) -> String {
        format!("https://download.pytorch.org/whl/{}", self.name())
    }

    /// Local version suffix pip reports for torch built against this index.
    pub fn torch_suffix(&self) -> String {
        format!("+{}", self.name())
    }
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Accelerator {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Accelerator::ALL
            .into_iter()
            .find(|a| a.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                ProvisionError::InvalidConfiguration(format!(
                    "accelerator must be one of cpu|cu118|cu121, got '{s}'"
                ))
            })
    }
}

/// Which Wan 2.2 diffusion models to fetch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModelSet {
    #[serde(rename = "5b")]
    Ti2v5b,
    #[serde(rename = "14b")]
    T2v14b,
    #[serde(rename = "i2v")]
    I2v14b,
    #[serde(rename = "all")]
    All,
}

impl ModelSet {
    pub const ALL: [ModelSet; 4] = [
        ModelSet::Ti2v5b,
        ModelSet::T2v14b,
        ModelSet::I2v14b,
        ModelSet::All,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModelSet::Ti2v5b => "5b",
            ModelSet::T2v14b => "14b",
            ModelSet::I2v14b => "i2v",
            ModelSet::All => "all",
        }
    }

    /// Repository-relative files of `group` needed by this set.
    pub fn files(&self, group: ModelGroup) -> Vec<&'static str> {
        match group {
            ModelGroup::Diffusion => match self {
                ModelSet::Ti2v5b => DIFFUSION_5B.to_vec(),
                ModelSet::T2v14b => DIFFUSION_14B.to_vec(),
                ModelSet::I2v14b => DIFFUSION_I2V.to_vec(),
                ModelSet::All => DIFFUSION_5B
                    .iter()
                    .chain(DIFFUSION_14B)
                    .chain(DIFFUSION_I2V)
                    .copied()
                    .collect(),
            },
            ModelGroup::Vae => VAE_FILES.to_vec(),
            ModelGroup::TextEncoders => TEXT_ENCODERS.to_vec(),
        }
    }
}

impl fmt::Display for ModelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelSet {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelSet::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                ProvisionError::InvalidConfiguration(format!(
                    "models must be one of 5b|14b|i2v|all, got '{s}'"
                ))
            })
    }
}

/// Model directories under `ComfyUI/models`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ModelGroup {
    Diffusion,
    Vae,
    TextEncoders,
}

impl ModelGroup {
    pub const ALL: [ModelGroup; 3] = [ModelGroup::Diffusion, ModelGroup::Vae, ModelGroup::TextEncoders];

    /// Directory name below `ComfyUI/models`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ModelGroup::Diffusion => "diffusion_models",
            ModelGroup::Vae => "vae",
            ModelGroup::TextEncoders => "text_encoders",
        }
    }
}

impl fmt::Display for ModelGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// File name component of a repository-relative path.
pub fn file_name(repo_path: &str) -> &str {
    repo_path.rsplit('/').next().unwrap_or(repo_path)
}
