// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use crate::cmd::run_capture;
use crate::error::{Result, SysError};

/// An image file attached to a loop device; detached when dropped
#[derive(Debug)]
pub struct Loopback {
    device_path: String,
    attached: bool,
}

impl Loopback {
    /// Attach `image` with partition scanning enabled
    pub fn attach(image: &Path) -> Result<Self> {
        let image_arg = image.to_string_lossy();
        let output = run_capture("losetup", &["--find", "--show", "--partscan", &image_arg])?;

        let device_path = output.trim().to_string();
        if !device_path.starts_with("/dev/") {
            return Err(SysError::Parse {
                what: "losetup".to_string(),
                reason: format!("unexpected device '{device_path}'"),
            });
        }

        tracing::info!(device = %device_path, image = %image.display(), "attached loop device");
        Ok(Self {
            device_path,
            attached: true,
        })
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Detach, reporting failure to the caller instead of only logging it
    pub fn detach(mut self) -> Result<()> {
        self.attached = false;
        detach_device(&self.device_path)
    }
}

fn detach_device(device_path: &str) -> Result<()> {
    run_capture("losetup", &["--detach", device_path])?;
    tracing::info!(device = device_path, "detached loop device");
    Ok(())
}

impl Drop for Loopback {
    fn drop(&mut self) {
        if self.attached
            && let Err(error) = detach_device(&self.device_path)
        {
            tracing::warn!(device = %self.device_path, "failed to detach loop device: {error}");
        }
    }
}
