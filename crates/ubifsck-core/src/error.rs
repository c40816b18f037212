/// Error types for the checker
///
/// Node-level defects never surface here: the parser reports them as
/// `InvalidNode` values and the policy engine decides what happens. What
/// remains are structural corruptions that callers map onto problems,
/// operational failures, and aborts decided by the policy engine.

use std::fmt;
use thiserror::Error;

use crate::check::problem::Problem;

/// On-flash structure that failed to read or validate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    Superblock,
    Master,
    Log,
    Bud,
    Index,
    Lpt,
    Orphan,
    Data,
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Corruption::Superblock => "superblock",
            Corruption::Master => "master node",
            Corruption::Log => "log",
            Corruption::Bud => "bud",
            Corruption::Index => "index",
            Corruption::Lpt => "LPT",
            Corruption::Orphan => "orphan area",
            Corruption::Data => "data",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum FsckError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted {what} at LEB {lnum}:{offs}: {detail}")]
    Corrupted {
        what: Corruption,
        lnum: u32,
        offs: u32,
        detail: String,
    },

    #[error("no free space")]
    NoSpace,

    #[error("volume is read-only")]
    ReadOnly,

    #[error("empty volume")]
    EmptyVolume,

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The policy engine refused or could not fix a problem that blocks progress
    #[error("unfixed problem: {0}")]
    Aborted(Problem),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FsckError {
    pub fn corrupted(what: Corruption, lnum: u32, offs: u32, detail: impl Into<String>) -> Self {
        FsckError::Corrupted {
            what,
            lnum,
            offs,
            detail: detail.into(),
        }
    }

    /// Kind of corruption, if this error reports one
    pub fn corruption(&self) -> Option<Corruption> {
        match self {
            FsckError::Corrupted { what, .. } => Some(*what),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FsckError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_kind() {
        let err = FsckError::corrupted(Corruption::Index, 12, 160, "bad level");
        assert_eq!(err.corruption(), Some(Corruption::Index));
        assert_eq!(err.to_string(), "corrupted index at LEB 12:160: bad level");
        assert_eq!(FsckError::NoSpace.corruption(), None);
    }
}
