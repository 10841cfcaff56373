//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod completions;
pub(crate) mod flash;
pub(crate) mod info;

use anyhow::{Context, Result};
use picoptic::{LoadOptions, MemoryImage};
use std::path::Path;

/// Load an Intel-HEX image, naming the file in any error.
pub(crate) fn load_image(path: &Path, ignore_out_of_range: bool) -> Result<MemoryImage> {
    let options = LoadOptions {
        ignore_out_of_range,
    };
    MemoryImage::from_file(path, &options)
        .with_context(|| format!("failed to load image {}", path.display()))
}
