use std::path::Path;

use anyhow::{Context, Result};

pub mod check;
pub mod error;
pub mod fs;
pub mod media;
pub mod volume;

// Re-export the types a front end needs for a run
pub use check::{
    ExitStatus, Fsck, FsckOptions, FsckProgress, FsckReport, FsckStage, Mode, Policy, Problem, Prompt,
};
pub use error::{Corruption, FsckError};
pub use volume::{ImageVolume, MemVolume, Volume};

/// Open a UBIFS image file and check it
///
/// The image is mapped writable unless `options.mode` is check-only.
pub fn check_image<P: AsRef<Path>>(path: P, options: FsckOptions) -> Result<FsckReport> {
    let path = path.as_ref();
    let writable = !options.mode.is_read_only();
    let mut vol = ImageVolume::open(path, writable)
        .with_context(|| format!("cannot open {}", path.display()))?;

    let mut fsck = Fsck::new(options);
    let report = fsck.run(&mut vol);
    if writable {
        vol.flush().context("cannot flush image")?;
    }
    Ok(report)
}
