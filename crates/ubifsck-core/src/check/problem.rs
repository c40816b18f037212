/// Problem taxonomy and the policy engine
///
/// Every inconsistency the checker can find is a `Problem`. What happens to a
/// problem depends only on its flags and the operating mode, and the decision
/// is made in one place: `Policy::fix_problem`.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;

use serde::Serialize;

use crate::error::{FsckError, Result};

const FIXABLE: u8 = 1;
const MUST_FIX: u8 = 2;
const DROP_DATA: u8 = 4;
const NEED_REBUILD: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Problem {
    SbCorrupted,
    MstCorrupted,
    LogCorrupted,
    BudCorrupted,
    TncCorrupted,
    TncDataCorrupted,
    OrphanCorrupted,
    InvalidInoNode,
    InvalidDentNode,
    InvalidDataNode,
    ScanCorrupted,
    FileHasNoInode,
    FileHas0NlinkInode,
    FileHasInconsistType,
    FileHasTooManyDent,
    FileShouldntHaveData,
    FileHasNoDent,
    XattrHasNoHost,
    XattrHasWrongHost,
    FileHasNoEncrypt,
    FileIsDisconnected,
    FileRootHasDent,
    DentryIsUnreachable,
    FileIsInconsistent,
    EmptyTnc,
    LptCorrupted,
    RootDirNotFound,
    DisconnectedFileCannotBeRecovered,
    SpaceStatIncorrect,
    LpIncorrect,
    IncorrectIdxSz,
}

impl Problem {
    fn flags(self) -> u8 {
        use Problem::*;
        match self {
            SbCorrupted => 0,
            MstCorrupted | LogCorrupted | TncCorrupted | EmptyTnc | RootDirNotFound => {
                FIXABLE | MUST_FIX | DROP_DATA | NEED_REBUILD
            }
            BudCorrupted | TncDataCorrupted | OrphanCorrupted | InvalidInoNode | InvalidDentNode
            | InvalidDataNode | ScanCorrupted => FIXABLE | MUST_FIX | DROP_DATA,
            FileHasNoInode | FileHas0NlinkInode | FileHasInconsistType | FileHasTooManyDent
            | FileShouldntHaveData | FileHasNoDent | XattrHasNoHost | XattrHasWrongHost
            | FileHasNoEncrypt | FileRootHasDent | DentryIsUnreachable
            | DisconnectedFileCannotBeRecovered => FIXABLE | DROP_DATA,
            FileIsDisconnected | FileIsInconsistent | LptCorrupted | SpaceStatIncorrect
            | LpIncorrect | IncorrectIdxSz => FIXABLE,
        }
    }

    pub fn is_fixable(self) -> bool {
        self.flags() & FIXABLE != 0
    }

    pub fn must_fix(self) -> bool {
        self.flags() & MUST_FIX != 0
    }

    pub fn drops_data(self) -> bool {
        self.flags() & DROP_DATA != 0
    }

    pub fn needs_rebuild(self) -> bool {
        self.flags() & NEED_REBUILD != 0
    }

    pub fn description(self) -> &'static str {
        use Problem::*;
        match self {
            SbCorrupted => "Corrupted superblock",
            MstCorrupted => "Corrupted master node",
            LogCorrupted => "Corrupted log area",
            BudCorrupted => "Corrupted bud LEB",
            TncCorrupted => "Corrupted index node",
            TncDataCorrupted => "Corrupted data searched from TNC",
            OrphanCorrupted => "Corrupted orphan LEB",
            InvalidInoNode => "Invalid inode node",
            InvalidDentNode => "Invalid dentry node",
            InvalidDataNode => "Invalid data node",
            ScanCorrupted => "Corrupted data is scanned",
            FileHasNoInode => "File has no inode",
            FileHas0NlinkInode => "File has zero-nlink inode",
            FileHasInconsistType => "File has inconsistent type",
            FileHasTooManyDent => "File has too many dentries",
            FileShouldntHaveData => "File should not have data",
            FileHasNoDent => "File has no dentries",
            XattrHasNoHost => "Xattr file has no host",
            XattrHasWrongHost => "Xattr file has wrong host",
            FileHasNoEncrypt => "Encrypted file has no encryption information",
            FileIsDisconnected => "File is disconnected(regular file without dentries)",
            FileRootHasDent => "File is root node",
            DentryIsUnreachable => "Dentry is unreachable",
            FileIsInconsistent => "File is inconsistent",
            EmptyTnc => "TNC is empty",
            LptCorrupted => "Corrupted pnode/nnode",
            RootDirNotFound => "Root dir not found",
            DisconnectedFileCannotBeRecovered => "Disconnected file cannot be recovered",
            SpaceStatIncorrect => "Incorrect space statistics",
            LpIncorrect => "Inconsistent properties for LEB",
            IncorrectIdxSz => "Incorrect index size",
        }
    }

    pub fn question(self) -> &'static str {
        use Problem::*;
        if self.needs_rebuild() {
            return "Rebuild filesystem?";
        }
        match self {
            BudCorrupted => "Drop bud?",
            TncDataCorrupted | InvalidInoNode | InvalidDentNode | InvalidDataNode | ScanCorrupted => {
                "Drop it?"
            }
            OrphanCorrupted => "Drop orphans on the LEB?",
            FileIsDisconnected => "Put it into disconnected list?",
            FileHasNoInode | FileHas0NlinkInode | FileHasInconsistType | FileHasTooManyDent
            | FileShouldntHaveData | FileHasNoDent | XattrHasNoHost | XattrHasWrongHost
            | FileHasNoEncrypt | FileRootHasDent | DentryIsUnreachable
            | DisconnectedFileCannotBeRecovered => "Delete it?",
            FileIsInconsistent | LpIncorrect | SpaceStatIncorrect | IncorrectIdxSz => "Correct it?",
            _ => "Fix it?",
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Operating mode, chosen once per run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Ask before every fix
    Normal,
    /// Fix what loses no data, abort otherwise
    Safe,
    /// Fix everything, abort if the index or log is unusable
    Danger0,
    /// Fix everything, rebuild if the index or log is unusable
    Danger1,
    Rebuild,
    /// Report only, never write
    Check,
}

impl Mode {
    pub fn name(self) -> &'static str {
        match self {
            Mode::Normal => "normal mode",
            Mode::Safe => "safe mode",
            Mode::Danger0 => "danger mode",
            Mode::Danger1 => "danger + rebuild mode",
            Mode::Rebuild => "rebuild mode",
            Mode::Check => "check mode",
        }
    }

    pub fn is_read_only(self) -> bool {
        self == Mode::Check
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Process exit status, a set of fsck(8) style bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ExitStatus(u32);

impl ExitStatus {
    pub const OK: ExitStatus = ExitStatus(0);
    pub const NONDESTRUCT: ExitStatus = ExitStatus(1);
    pub const REBOOT: ExitStatus = ExitStatus(2);
    pub const UNCORRECTED: ExitStatus = ExitStatus(4);
    pub const ERROR: ExitStatus = ExitStatus(8);
    pub const USAGE: ExitStatus = ExitStatus(16);
    pub const CANCELED: ExitStatus = ExitStatus(32);
    pub const LIBRARY: ExitStatus = ExitStatus(128);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: ExitStatus) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ExitStatus) {
        self.0 |= other.0;
    }

    /// Nothing beyond "modified" is set
    pub fn is_success(self) -> bool {
        self.0 & !Self::NONDESTRUCT.0 == 0
    }
}

impl BitOr for ExitStatus {
    type Output = ExitStatus;

    fn bitor(self, rhs: ExitStatus) -> ExitStatus {
        ExitStatus(self.0 | rhs.0)
    }
}

/// Source of answers in normal mode
pub trait Prompt {
    /// Ask a yes/no question; `default` is the suggested answer
    fn confirm(&mut self, question: &str, default: bool) -> bool;
}

/// Decides fix, skip or abort for every problem and keeps the exit status
pub struct Policy {
    mode: Mode,
    exit: ExitStatus,
    prompt: Option<Box<dyn Prompt>>,
    detected: BTreeMap<Problem, u32>,
    fixed: u32,
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("mode", &self.mode)
            .field("exit", &self.exit)
            .field("detected", &self.detected)
            .field("fixed", &self.fixed)
            .finish()
    }
}

impl Policy {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            exit: ExitStatus::OK,
            prompt: None,
            detected: BTreeMap::new(),
            fixed: 0,
        }
    }

    pub fn with_prompt(mut self, prompt: Box<dyn Prompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Switch to rebuild mode after a fatal index, log or master problem
    pub fn escalate(&mut self) {
        tracing::info!("Switching from {} to rebuild mode", self.mode);
        self.mode = Mode::Rebuild;
    }

    pub fn exit_status(&self) -> ExitStatus {
        self.exit
    }

    pub fn add_exit(&mut self, status: ExitStatus) {
        self.exit.insert(status);
    }

    pub fn detected(&self) -> &BTreeMap<Problem, u32> {
        &self.detected
    }

    pub fn problem_count(&self) -> u32 {
        self.detected.values().sum()
    }

    pub fn fixed(&self) -> u32 {
        self.fixed
    }

    /// Decide whether `problem` gets fixed
    ///
    /// Returns `Ok(true)` to fix and `Ok(false)` to leave it. Problems that
    /// cannot be fixed, and must-fix problems that are declined, abort the run
    /// with `FsckError::Aborted`. In rebuild mode every problem is fixed
    /// implicitly and nothing is asked.
    pub fn fix_problem(&mut self, problem: Problem, detail: Option<&str>) -> Result<bool> {
        *self.detected.entry(problem).or_insert(0) += 1;
        let detail = detail.map(|d| format!(", {}", d)).unwrap_or_default();

        if self.mode == Mode::Rebuild {
            tracing::debug!("problem: {}{}", problem, detail);
            self.fixed += 1;
            return Ok(true);
        }

        tracing::warn!("problem: {}{}", problem, detail);
        if !problem.is_fixable() {
            self.exit.insert(ExitStatus::UNCORRECTED);
            return Err(FsckError::Aborted(problem));
        }

        let mut def_y = true;
        let mut ask = true;
        if self.mode == Mode::Check
            || (self.mode == Mode::Safe && problem.drops_data())
            || (matches!(self.mode, Mode::Safe | Mode::Danger0) && problem.needs_rebuild())
        {
            def_y = false;
        }
        if problem.needs_rebuild() && matches!(self.mode, Mode::Danger0 | Mode::Danger1) {
            ask = false;
        }

        let answer = if self.mode == Mode::Normal {
            match self.prompt.as_mut() {
                Some(prompt) => prompt.confirm(problem.question(), def_y),
                None => def_y,
            }
        } else {
            if ask {
                tracing::info!("{} {}", problem.question(), if def_y { "y" } else { "n" });
            }
            def_y
        };

        if !answer {
            self.exit.insert(ExitStatus::UNCORRECTED);
            if problem.must_fix() {
                return Err(FsckError::Aborted(problem));
            }
            return Ok(false);
        }
        self.exit.insert(ExitStatus::NONDESTRUCT);
        self.fixed += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Answer(bool, Vec<String>);

    impl Prompt for Answer {
        fn confirm(&mut self, question: &str, _default: bool) -> bool {
            self.1.push(question.to_string());
            self.0
        }
    }

    #[test]
    fn test_flags() {
        assert!(!Problem::SbCorrupted.is_fixable());
        assert!(Problem::TncCorrupted.needs_rebuild());
        assert!(Problem::BudCorrupted.must_fix());
        assert!(!Problem::FileIsInconsistent.drops_data());
        assert_eq!(Problem::MstCorrupted.question(), "Rebuild filesystem?");
        assert_eq!(Problem::FileHasNoDent.question(), "Delete it?");
        assert_eq!(Problem::LptCorrupted.question(), "Fix it?");
    }

    #[test]
    fn test_check_mode_never_fixes() {
        let mut policy = Policy::new(Mode::Check);
        assert!(!policy.fix_problem(Problem::FileIsInconsistent, None).unwrap());
        assert!(matches!(
            policy.fix_problem(Problem::InvalidInoNode, None),
            Err(FsckError::Aborted(Problem::InvalidInoNode))
        ));
        assert!(policy.exit_status().contains(ExitStatus::UNCORRECTED));
        assert!(!policy.exit_status().contains(ExitStatus::NONDESTRUCT));
        assert_eq!(policy.problem_count(), 2);
        assert_eq!(policy.fixed(), 0);
    }

    #[test]
    fn test_safe_mode_keeps_data() {
        let mut policy = Policy::new(Mode::Safe);
        assert!(policy.fix_problem(Problem::LpIncorrect, None).unwrap());
        assert!(!policy.fix_problem(Problem::FileHasNoDent, None).unwrap());
        assert!(policy.fix_problem(Problem::TncCorrupted, None).is_err());
        let exit = policy.exit_status();
        assert!(exit.contains(ExitStatus::NONDESTRUCT | ExitStatus::UNCORRECTED));
    }

    #[test]
    fn test_danger_modes_and_rebuild() {
        let mut plain = Policy::new(Mode::Danger0);
        assert!(plain.fix_problem(Problem::ScanCorrupted, None).unwrap());
        assert!(plain.fix_problem(Problem::LogCorrupted, None).is_err());

        let mut rebuild = Policy::new(Mode::Danger1);
        assert!(rebuild.fix_problem(Problem::LogCorrupted, None).unwrap());
        rebuild.escalate();
        assert_eq!(rebuild.mode(), Mode::Rebuild);
        assert!(rebuild.fix_problem(Problem::FileHasNoInode, None).unwrap());
    }

    #[test]
    fn test_normal_mode_asks() {
        let mut policy = Policy::new(Mode::Normal).with_prompt(Box::new(Answer(false, Vec::new())));
        assert!(!policy.fix_problem(Problem::FileIsInconsistent, Some("inode 65")).unwrap());
        assert!(policy.fix_problem(Problem::BudCorrupted, None).is_err());

        let mut policy = Policy::new(Mode::Normal);
        assert!(policy.fix_problem(Problem::FileIsInconsistent, None).unwrap());
    }

    #[test]
    fn test_unfixable_aborts() {
        let mut policy = Policy::new(Mode::Danger1);
        assert!(matches!(
            policy.fix_problem(Problem::SbCorrupted, None),
            Err(FsckError::Aborted(Problem::SbCorrupted))
        ));
        assert!(!policy.exit_status().is_success());
    }
}
