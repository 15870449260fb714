use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::striper::Layout;

fn default_object_size_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_stripe_unit_bytes() -> u64 {
    0
}

fn default_stripe_count() -> u64 {
    1
}

fn default_enable_alloc_hint() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageOptions {
    #[serde(default = "default_object_size_bytes")]
    pub object_size_bytes: u64,
    /// 0 selects the object size (no sub-object striping).
    #[serde(default = "default_stripe_unit_bytes")]
    pub stripe_unit_bytes: u64,
    #[serde(default = "default_stripe_count")]
    pub stripe_count: u64,
    #[serde(default)]
    pub clone_copy_on_read: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_enable_alloc_hint")]
    pub enable_alloc_hint: bool,
    #[serde(default)]
    pub balance_snap_reads: bool,
    #[serde(default)]
    pub localize_snap_reads: bool,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            object_size_bytes: default_object_size_bytes(),
            stripe_unit_bytes: default_stripe_unit_bytes(),
            stripe_count: default_stripe_count(),
            clone_copy_on_read: false,
            read_only: false,
            enable_alloc_hint: default_enable_alloc_hint(),
            balance_snap_reads: false,
            localize_snap_reads: false,
        }
    }
}

impl ImageOptions {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read image options at {}", path.display()))?;
        let opts: Self = toml::from_str(&raw).context("failed to parse image options")?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.object_size_bytes.is_power_of_two() {
            bail!("object_size_bytes must be a power of two");
        }
        if self.object_size_bytes < 4096 || self.object_size_bytes > 32 * 1024 * 1024 {
            bail!("object_size_bytes must be in range 4096..=33554432");
        }
        let stripe_unit = self.stripe_unit();
        if stripe_unit == 0 || self.object_size_bytes % stripe_unit != 0 {
            bail!("stripe_unit_bytes must divide object_size_bytes");
        }
        if self.stripe_count == 0 {
            bail!("stripe_count must be >= 1");
        }
        if self.balance_snap_reads && self.localize_snap_reads {
            bail!("balance_snap_reads and localize_snap_reads are mutually exclusive");
        }
        Ok(())
    }

    pub fn stripe_unit(&self) -> u64 {
        if self.stripe_unit_bytes == 0 {
            self.object_size_bytes
        } else {
            self.stripe_unit_bytes
        }
    }

    pub fn layout(&self) -> Layout {
        Layout {
            object_size: self.object_size_bytes,
            stripe_unit: self.stripe_unit(),
            stripe_count: self.stripe_count,
        }
    }
}
