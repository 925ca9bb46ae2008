// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use image_types::DiskLayout;

use crate::error::{EngineError, Result};
use crate::plan::PlanOptions;

/// Engine settings, optionally loaded from TOML
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Parent directory for scratch mount points
    pub build_dir: PathBuf,
    pub plan: PlanOptions,
    /// Overrides the kernel command line found in the image
    pub kernel_cmdline: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            build_dir: std::env::temp_dir(),
            plan: PlanOptions::default(),
            kernel_cmdline: None,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|error| EngineError::Config(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(EngineError::io(path))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.build_dir.is_absolute() {
            return Err(EngineError::Config(format!(
                "build_dir must be absolute: {}",
                self.build_dir.display()
            )));
        }
        Ok(())
    }

    /// A fresh scratch directory under `build_dir`, removed when dropped
    pub fn scratch_dir(&self, prefix: &str) -> Result<tempfile::TempDir> {
        fs::create_dir_all(&self.build_dir).map_err(EngineError::io(&self.build_dir))?;
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.build_dir)
            .map_err(EngineError::io(&self.build_dir))
    }

    /// A fresh, empty directory under `build_dir` for a chroot.
    ///
    /// Unlike [`EngineConfig::scratch_dir`] it is never removed recursively;
    /// callers remove it with `fs::remove_dir` once everything is unmounted.
    pub fn chroot_dir(&self) -> Result<PathBuf> {
        let path = self.build_dir.join(format!("chroot-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&path).map_err(EngineError::io(&path))?;
        Ok(path)
    }
}

/// Load and validate a disk layout file
pub fn load_layout(path: &Path) -> Result<DiskLayout> {
    let text = fs::read_to_string(path).map_err(EngineError::io(path))?;
    Ok(DiskLayout::from_toml_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
build_dir = "/var/tmp/image-build"

[plan]
read_only_verity = true
"#,
        )
        .unwrap();

        assert_eq!(config.build_dir, PathBuf::from("/var/tmp/image-build"));
        assert!(config.plan.read_only_verity);
        assert!(config.plan.include_default_mounts);
        assert!(!config.plan.read_only);
        assert_eq!(config.kernel_cmdline, None);
    }

    #[test]
    fn relative_build_dir_is_rejected() {
        assert!(matches!(
            EngineConfig::from_toml_str("build_dir = \"build\"\n"),
            Err(EngineError::Config(_))
        ));
    }
}
