/// The checking engine
///
/// `Fsck` drives one run over a volume: it loads the filesystem, walks the
/// index into a file graph, validates and reconciles the files, moves
/// nameless files into lost+found and finally verifies space accounting.
/// Damage to the index, log or master that cannot be repaired incrementally
/// turns the run into a rebuild when the operating mode allows it.

pub mod disconnected;
pub mod file;
pub mod parse;
pub mod problem;
pub mod rebuild;
pub mod reconcile;
pub mod space;
pub mod traverse;
pub mod validate;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use problem::{ExitStatus, Mode, Policy, Problem, Prompt};

use crate::error::{Corruption, FsckError, Result};
use crate::fs::commit::commit;
use crate::fs::lpt::read_lpt;
use crate::fs::master::{read_master, validate_master, Master};
use crate::fs::replay::{apply_buds, kill_orphans, read_log, read_orphans, recover_bud, scan_buds};
use crate::fs::superblock::{read_superblock, validate_sb};
use crate::fs::tnc::Tnc;
use crate::fs::FsInfo;
use crate::media::ROOT_INO;
use crate::volume::Volume;
use file::Repair;

/// Options for one run
pub struct FsckOptions {
    pub mode: Mode,
    /// Device or image name, used in messages
    pub dev_name: String,
    /// Answers questions in normal mode; without one the default answer is taken
    pub prompt: Option<Box<dyn Prompt>>,
}

impl FsckOptions {
    pub fn new(mode: Mode, dev_name: impl Into<String>) -> Self {
        Self {
            mode,
            dev_name: dev_name.into(),
            prompt: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FsckStage {
    ReadSuperblock,
    ReadMaster,
    LoadIndex,
    ReplayJournal,
    ReadLpt,
    TraverseIndex,
    CheckFiles,
    CheckReachability,
    CheckFileInfo,
    HandleDisconnected,
    CheckSpace,
    Commit,
    Rebuild,
    Complete,
}

impl FsckStage {
    pub fn description(self) -> &'static str {
        match self {
            FsckStage::ReadSuperblock => "Read superblock",
            FsckStage::ReadMaster => "Read master",
            FsckStage::LoadIndex => "Load TNC",
            FsckStage::ReplayJournal => "Replay journal",
            FsckStage::ReadLpt => "Read LPT",
            FsckStage::TraverseIndex => "Traverse TNC and construct files",
            FsckStage::CheckFiles => "Check and handle invalid files",
            FsckStage::CheckReachability => "Check and handle unreachable files",
            FsckStage::CheckFileInfo => "Check and correct files",
            FsckStage::HandleDisconnected => "Handle disconnected files",
            FsckStage::CheckSpace => "Check and correct space statistics",
            FsckStage::Commit => "Commit",
            FsckStage::Rebuild => "Rebuild filesystem",
            FsckStage::Complete => "Done",
        }
    }

    fn percent(self) -> f32 {
        match self {
            FsckStage::ReadSuperblock => 0.0,
            FsckStage::ReadMaster => 5.0,
            FsckStage::LoadIndex => 10.0,
            FsckStage::ReplayJournal => 15.0,
            FsckStage::ReadLpt => 20.0,
            FsckStage::TraverseIndex => 25.0,
            FsckStage::CheckFiles => 50.0,
            FsckStage::CheckReachability => 60.0,
            FsckStage::CheckFileInfo => 70.0,
            FsckStage::HandleDisconnected => 80.0,
            FsckStage::CheckSpace => 85.0,
            FsckStage::Commit => 90.0,
            FsckStage::Rebuild => 30.0,
            FsckStage::Complete => 100.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FsckProgress {
    pub stage: FsckStage,
    pub progress_percent: f32,
    pub files_found: usize,
    pub current_operation: String,
}

/// Summary of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct FsckReport {
    pub device: String,
    pub mode: Mode,
    pub exit_code: ExitStatus,
    pub problems: BTreeMap<Problem, u32>,
    pub fixed: u32,
    pub files: usize,
    pub rebuilt: bool,
    pub committed: bool,
    /// Why the run stopped early, if it did
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FsckReport {
    pub fn problem_count(&self) -> u32 {
        self.problems.values().sum()
    }

    /// Closing lines printed by the command line tool
    pub fn summary(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if self.exit_code.contains(ExitStatus::NONDESTRUCT) {
            lines.push("Filesystem was modified".to_string());
        }
        if self.exit_code.contains(ExitStatus::UNCORRECTED) {
            lines.push("WARNING: Filesystem still has errors".to_string());
        }
        if self.exit_code.is_success() {
            lines.push("FSCK success!".to_string());
        } else {
            lines.push(format!("FSCK failed, exit code {}", self.exit_code.bits()));
        }
        lines
    }
}

/// What a completed check produced
#[derive(Debug, Default)]
struct Outcome {
    files: usize,
    rebuilt: bool,
    committed: bool,
}

/// The state loaded before files are checked
struct Loaded {
    fs: FsInfo,
    master: Master,
    tnc: Tnc,
    lprops: Option<Vec<crate::fs::lpt::Lprops>>,
    /// Journal or orphans were applied in memory only
    pending: bool,
    /// The index as of the last commit, kept in check mode when the journal
    /// or orphans changed it
    committed: Option<Tnc>,
    /// LEBs the journal wrote to since the last commit
    buds: BTreeSet<u32>,
}

/// A load step either worked or hit damage that calls for a rebuild
enum Load<T> {
    Ready(T),
    Rebuild(FsInfo),
}

pub struct Fsck {
    dev_name: String,
    policy: Policy,
    progress_callback: Option<Box<dyn Fn(FsckProgress) + Send + Sync>>,
}

impl Fsck {
    pub fn new(options: FsckOptions) -> Self {
        let mut policy = Policy::new(options.mode);
        if let Some(prompt) = options.prompt {
            policy = policy.with_prompt(prompt);
        }
        Self {
            dev_name: options.dev_name,
            policy,
            progress_callback: None,
        }
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(FsckProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    fn emit_progress(&self, stage: FsckStage, files_found: usize) {
        tracing::info!("{}", stage.description());
        if let Some(ref callback) = self.progress_callback {
            callback(FsckProgress {
                stage,
                progress_percent: stage.percent(),
                files_found,
                current_operation: stage.description().to_string(),
            });
        }
    }

    /// Check (and depending on the mode, repair) the filesystem on `vol`
    pub fn run(&mut self, vol: &mut dyn Volume) -> FsckReport {
        let started_at = Utc::now();
        let mode = self.policy.mode();
        tracing::info!("Checking {} in {}", self.dev_name, mode);

        let (outcome, error) = match self.check(vol) {
            Ok(outcome) => (outcome, None),
            Err(FsckError::Aborted(problem)) => {
                tracing::error!("{} is not fixed, stop checking", problem);
                (Outcome::default(), Some(format!("unfixed problem: {}", problem)))
            }
            Err(err) => {
                tracing::error!("{}", err);
                self.policy.add_exit(ExitStatus::ERROR);
                (Outcome::default(), Some(err.to_string()))
            }
        };
        if outcome.committed || outcome.rebuilt {
            self.policy.add_exit(ExitStatus::NONDESTRUCT);
        }
        self.emit_progress(FsckStage::Complete, outcome.files);

        FsckReport {
            device: self.dev_name.clone(),
            mode,
            exit_code: self.policy.exit_status(),
            problems: self.policy.detected().clone(),
            fixed: self.policy.fixed(),
            files: outcome.files,
            rebuilt: outcome.rebuilt,
            committed: outcome.committed,
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn check(&mut self, vol: &mut dyn Volume) -> Result<Outcome> {
        let loaded = match self.load(vol)? {
            Load::Ready(loaded) => loaded,
            Load::Rebuild(fs) => return self.rebuild(vol, fs),
        };
        match self.check_files(vol, loaded)? {
            Load::Ready(outcome) => Ok(outcome),
            Load::Rebuild(fs) => self.rebuild(vol, fs),
        }
    }

    /// Report a problem that can only be cured by a rebuild
    ///
    /// Returns normally only when the rebuild was accepted; a declined or
    /// disallowed rebuild aborts the run.
    fn rebuild_problem(&mut self, problem: Problem, err: &FsckError) -> Result<()> {
        self.policy.fix_problem(problem, Some(&err.to_string()))?;
        Ok(())
    }

    fn load(&mut self, vol: &mut dyn Volume) -> Result<Load<Loaded>> {
        let check_only = self.policy.mode().is_read_only();
        self.emit_progress(FsckStage::ReadSuperblock, 0);
        if vol.is_empty()? {
            return Err(FsckError::EmptyVolume);
        }
        if vol.is_read_only() && !check_only {
            return Err(FsckError::ReadOnly);
        }
        let sb = match read_superblock(vol) {
            Ok(sb) => sb,
            Err(err @ FsckError::Corrupted { .. }) => {
                self.policy.fix_problem(Problem::SbCorrupted, Some(&err.to_string()))?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        let mut fs = validate_sb(&sb, vol)?;

        self.emit_progress(FsckStage::ReadMaster, 0);
        let master = match read_master(vol, &fs).and_then(|m| validate_master(&fs, &m).map(|_| m)) {
            Ok(master) => master,
            Err(err) if err.corruption().is_some() => {
                self.rebuild_problem(Problem::MstCorrupted, &err)?;
                return Ok(Load::Rebuild(fs));
            }
            Err(err) => return Err(err),
        };
        let mst = &master.node;
        fs.highest_inum = mst.highest_inum;
        fs.cmt_no = mst.cmt_no;
        fs.saw_sqnum(master.sqnum);

        self.emit_progress(FsckStage::LoadIndex, 0);
        let mut tnc = match Tnc::load(vol, &fs, mst) {
            Ok(tnc) => tnc,
            Err(err) if err.corruption().is_some() => {
                self.rebuild_problem(Problem::TncCorrupted, &err)?;
                return Ok(Load::Rebuild(fs));
            }
            Err(err) => return Err(err),
        };

        self.emit_progress(FsckStage::ReplayJournal, 0);
        let buds = match read_log(vol, &fs, mst) {
            Ok(buds) => buds,
            Err(err) if err.corruption().is_some() => {
                self.rebuild_problem(Problem::LogCorrupted, &err)?;
                return Ok(Load::Rebuild(fs));
            }
            Err(err) => return Err(err),
        };
        let committed = check_only.then(|| tnc.clone());
        let scans = scan_buds(vol, &fs, &buds)?;
        for scan in scans.iter().filter(|s| s.sleb.is_corrupted()) {
            let detail = format!(
                "bud LEB {} corrupted at {}",
                scan.bud.lnum,
                scan.sleb.corrupted_at.unwrap_or(0)
            );
            if self.policy.fix_problem(Problem::BudCorrupted, Some(&detail))? && !check_only {
                recover_bud(vol, &fs, scan)?;
            }
        }
        let replayed = match apply_buds(vol, &mut fs, &mut tnc, &scans) {
            Ok(n) => n,
            Err(err) if err.corruption().is_some() => {
                self.rebuild_problem(Problem::LogCorrupted, &err)?;
                return Ok(Load::Rebuild(fs));
            }
            Err(err) => return Err(err),
        };

        let orphans = read_orphans(vol, &fs, mst)?;
        let mut inos = Vec::new();
        for leb in &orphans {
            if let Some(at) = leb.corrupted_at {
                let detail = format!("orphan LEB {} corrupted at {}", leb.lnum, at);
                self.policy.fix_problem(Problem::OrphanCorrupted, Some(&detail))?;
            }
            inos.extend_from_slice(&leb.inos);
        }
        let killed = kill_orphans(vol, &fs, &mut tnc, &inos)?;
        if killed > 0 {
            tracing::info!("Deleted {} orphaned inodes", killed);
        }

        self.emit_progress(FsckStage::ReadLpt, 0);
        let lprops = match read_lpt(vol, &fs, mst) {
            Ok(lprops) => Some(lprops),
            Err(err) if err.corruption().is_some() => {
                tracing::warn!("{}", err);
                None
            }
            Err(err) => return Err(err),
        };

        let pending = replayed > 0 || !orphans.is_empty() || master.needs_write;
        Ok(Load::Ready(Loaded {
            fs,
            master,
            tnc,
            lprops,
            pending,
            committed: committed.filter(|_| pending),
            buds: buds.iter().map(|b| b.lnum).collect(),
        }))
    }

    fn check_files(&mut self, vol: &mut dyn Volume, loaded: Loaded) -> Result<Load<Outcome>> {
        let Loaded {
            mut fs,
            master,
            mut tnc,
            lprops,
            pending,
            committed,
            buds,
        } = loaded;
        let check_only = self.policy.mode().is_read_only();

        self.emit_progress(FsckStage::TraverseIndex, 0);
        let traversed = match traverse::traverse_tnc(vol, &mut fs, &mut tnc, &mut self.policy) {
            Ok(traversed) => traversed,
            Err(err) if err.corruption() == Some(Corruption::Index) => {
                self.rebuild_problem(Problem::TncCorrupted, &err)?;
                return Ok(Load::Rebuild(fs));
            }
            Err(err) => return Err(err),
        };
        let mut tree = traversed.tree;
        if tnc.leaf_count() == 0 {
            let err = FsckError::corrupted(Corruption::Index, master.node.root_lnum, master.node.root_offs, "no leaves left");
            self.rebuild_problem(Problem::EmptyTnc, &err)?;
            return Ok(Load::Rebuild(fs));
        }

        self.emit_progress(FsckStage::CheckFiles, tree.len());
        let mut validated = {
            let mut repair = Repair::new(&mut self.policy, Some(&mut tnc));
            validate::filter_invalid_files(&mut repair, &mut tree)?
        };
        if !tree.contains(ROOT_INO) {
            let err = FsckError::corrupted(Corruption::Index, master.node.root_lnum, master.node.root_offs, "root directory is missing");
            self.rebuild_problem(Problem::RootDirNotFound, &err)?;
            return Ok(Load::Rebuild(fs));
        }

        self.emit_progress(FsckStage::CheckReachability, tree.len());
        {
            let mut repair = Repair::new(&mut self.policy, Some(&mut tnc));
            validate::extract_dentry_tree(&mut repair, &mut tree, &mut validated)?;
        }

        self.emit_progress(FsckStage::CheckFileInfo, tree.len());
        {
            let mut repair = Repair::new(&mut self.policy, Some(&mut tnc));
            let flash = if check_only { None } else { Some(&mut *vol) };
            reconcile::check_and_correct_files(&mut repair, flash, &mut tree)?;
        }

        if !validated.disconnected.is_empty() {
            self.emit_progress(FsckStage::HandleDisconnected, tree.len());
            let disconnected = std::mem::take(&mut validated.disconnected);
            let relocated = disconnected::relocate(vol, &mut fs, &mut tnc, &mut self.policy, &mut tree, disconnected)?;
            tracing::info!(
                "{} disconnected files recovered, {} dropped",
                relocated.recovered,
                relocated.dropped
            );
        }

        let mut outcome = Outcome {
            files: tree.len(),
            ..Outcome::default()
        };

        self.emit_progress(FsckStage::CheckSpace, outcome.files);
        let no_buds = BTreeSet::new();
        let needs_commit = if !tnc.is_dirty() && !pending {
            space::check_space(vol, &fs, &tnc, &master.node, lprops.as_deref(), &no_buds, &mut self.policy)?.needs_commit
        } else if check_only {
            // The on-flash LPT describes the last commit: compare it with the
            // committed index everywhere the journal did not write
            let base = committed.as_ref().unwrap_or(&tnc);
            space::check_space(vol, &fs, base, &master.node, lprops.as_deref(), &buds, &mut self.policy)?;
            false
        } else {
            // The on-flash LPT does not describe uncommitted changes
            tracing::debug!("index changed, space is recalculated by the commit");
            true
        };

        if needs_commit && !check_only {
            self.emit_progress(FsckStage::Commit, outcome.files);
            commit(vol, &mut fs, &mut tnc, &master.node)?;
            outcome.committed = true;
        }
        Ok(Load::Ready(outcome))
    }

    fn rebuild(&mut self, vol: &mut dyn Volume, mut fs: FsInfo) -> Result<Outcome> {
        self.emit_progress(FsckStage::Rebuild, 0);
        let rebuilt = rebuild::rebuild_filesystem(vol, &mut fs, &mut self.policy)?;
        Ok(Outcome {
            files: rebuilt.files,
            rebuilt: true,
            committed: rebuilt.committed.is_some(),
        })
    }
}
