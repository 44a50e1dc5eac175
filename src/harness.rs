//! The tamper challenge and the collaborators it talks to.
//!
//! A [`Challenge`] steals the key checkpoint, lets a [`Strategy`] log through
//! the daemon for a while, hands it a writable copy of the journal and then
//! asks a [`SealVerifier`] whether the copy still verifies, is sealed at
//! least as far as the original and reads differently.  The daemon, the
//! verifier and the file store are traits; the in-process implementations
//! here stand in for the real ones.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::attack::{AttackOptions, AttackReport, Attacker};
use crate::error::{Error, Result};
use crate::fsprng::FsKey;
use crate::verify::{self, QueryLine, VerifyOptions};
use crate::view::Region;
use crate::writer::{JournalWriter, WriterOptions};

pub const JOURNAL_FILE: &str = "system.journal";
pub const PATCHED_FILE: &str = "system.journal.patched";
pub const KEY_FILE: &str = "fss";

/// Coverage slack for the comparison query.
const QUERY_SLACK_USEC: u64 = 1_000_000;

// ── Collaborators ────────────────────────────────────────────────────────────

/// The logging daemon as seen by a client.
pub trait LogAppender {
    fn log(&mut self, message: &str) -> Result<()>;
    /// Let the clock run into the next sealing epoch.
    fn advance_epoch(&mut self) -> Result<()>;
}

/// The external verification and query tool.
pub trait SealVerifier {
    /// Realtime up to which the file is sealed; `None` if nothing is.
    fn sealed_coverage(&self, region: &Region) -> Result<Option<u64>>;
    fn query(&self, region: &Region, until: u64) -> Result<Vec<QueryLine>>;
}

/// Named file store holding the journal and the key checkpoint.
pub trait SnapshotProvider {
    fn snapshot(&self, name: &str) -> Result<Region>;
    /// Copy `name` to `copy` and open the copy.
    fn writable_copy(&self, name: &str, copy: &str) -> Result<Region>;
    fn store(&self, name: &str, region: &Region) -> Result<()>;
}

pub trait Strategy {
    fn interact(&mut self, log: &mut dyn LogAppender) -> Result<()>;
    fn tamper(&mut self, region: &mut Region, key: &FsKey) -> Result<()>;
}

// ── DirectorySnapshots ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DirectorySnapshots {
    root: PathBuf,
}

impl DirectorySnapshots {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        fs::create_dir_all(root.as_ref())?;
        Ok(Self { root: root.as_ref().to_path_buf() })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl SnapshotProvider for DirectorySnapshots {
    fn snapshot(&self, name: &str) -> Result<Region> {
        Ok(Region::open(self.path(name))?)
    }

    fn writable_copy(&self, name: &str, copy: &str) -> Result<Region> {
        fs::copy(self.path(name), self.path(copy))?;
        self.snapshot(copy)
    }

    fn store(&self, name: &str, region: &Region) -> Result<()> {
        Ok(region.save(self.path(name))?)
    }
}

// ── SimulatedJournal ─────────────────────────────────────────────────────────

/// A sealing daemon on a virtual clock.  Every change is persisted to the
/// snapshot store, the key checkpoint included, the way the daemon keeps its
/// evolving key on disk.
pub struct SimulatedJournal {
    writer:    JournalWriter,
    snapshots: DirectorySnapshots,
    clock:     u64,
    options:   WriterOptions,
}

impl SimulatedJournal {
    /// Messages are spaced this far apart.
    pub const TICK_USEC: u64 = 1_000;

    pub fn new(key: FsKey, options: WriterOptions, snapshots: DirectorySnapshots) -> Result<Self> {
        let clock = key.epoch_window(key.min_epoch()).0 + Self::TICK_USEC;
        let writer = JournalWriter::new(key, options.clone())?;
        let journal = Self { writer, snapshots, clock, options };
        journal.persist()?;
        Ok(journal)
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn writer(&self) -> &JournalWriter {
        &self.writer
    }

    fn persist(&self) -> Result<()> {
        self.snapshots.store(JOURNAL_FILE, self.writer.region())?;
        let checkpoint = self
            .writer
            .key()
            .to_checkpoint(self.writer.current_epoch(), self.options.machine_id, self.options.boot_id)?;
        fs::write(self.snapshots.path(KEY_FILE), checkpoint)?;
        Ok(())
    }
}

impl LogAppender for SimulatedJournal {
    fn log(&mut self, message: &str) -> Result<()> {
        let message = format!("MESSAGE={message}");
        let fields: [&[u8]; 3] = [message.as_bytes(), b"PRIORITY=6", b"SYSLOG_IDENTIFIER=sealbreak"];
        self.writer.append(self.clock, &fields)?;
        self.clock += Self::TICK_USEC;
        self.persist()
    }

    fn advance_epoch(&mut self) -> Result<()> {
        let key = self.writer.key();
        let next = key.epoch_at(self.clock) + 1;
        self.clock = key.epoch_window(next).0 + Self::TICK_USEC;
        self.writer.advance_to_epoch(next)?;
        debug!(epoch = next, clock = self.clock, "advanced epoch");
        self.persist()
    }
}

// ── InProcessVerifier ────────────────────────────────────────────────────────

pub struct InProcessVerifier {
    key:     FsKey,
    options: VerifyOptions,
}

impl InProcessVerifier {
    pub fn new(key: FsKey, options: VerifyOptions) -> Self {
        Self { key, options }
    }
}

impl SealVerifier for InProcessVerifier {
    fn sealed_coverage(&self, region: &Region) -> Result<Option<u64>> {
        verify::sealed_coverage(region, &self.key, &self.options)
    }

    fn query(&self, region: &Region, until: u64) -> Result<Vec<QueryLine>> {
        verify::query(region, until)
    }
}

// ── ForgeStrategy ────────────────────────────────────────────────────────────

/// Logs one distinctive line, lets its epoch close, logs a repeated
/// heartbeat through the next epoch and then forges the distinctive line.
pub struct ForgeStrategy {
    pub target:    String,
    pub heartbeat: String,
    pub options:   AttackOptions,
    report:        Option<AttackReport>,
}

impl Default for ForgeStrategy {
    fn default() -> Self {
        Self {
            target:    "session opened for user root by operator".to_string(),
            heartbeat: "heartbeat".to_string(),
            options:   AttackOptions::default(),
            report:    None,
        }
    }
}

impl ForgeStrategy {
    pub fn report(&self) -> Option<&AttackReport> {
        self.report.as_ref()
    }
}

impl Strategy for ForgeStrategy {
    fn interact(&mut self, log: &mut dyn LogAppender) -> Result<()> {
        log.log(&self.target)?;
        log.advance_epoch()?;
        log.log(&self.heartbeat)?;
        log.log(&self.heartbeat)?;
        log.advance_epoch()
    }

    fn tamper(&mut self, region: &mut Region, key: &FsKey) -> Result<()> {
        let report = Attacker::new(key.clone(), self.options.clone()).tamper(region)?;
        self.report = Some(report);
        Ok(())
    }
}

// ── Challenge ────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum AttackFailed {
    #[error("attack aborted: {0}")]
    Aborted(#[source] Error),
    #[error("tampered journal was rejected: {0}")]
    Rejected(#[source] Error),
    #[error("tampered journal is sealed less ({patched:?} < {original:?})")]
    SealedLess { original: Option<u64>, patched: Option<u64> },
    #[error("query output does not differ")]
    OutputIdentical,
}

#[derive(Error, Debug)]
pub enum ChallengeError {
    #[error(transparent)]
    Failed(#[from] AttackFailed),
    #[error("challenge setup failed: {0}")]
    Setup(#[from] Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangedLine {
    pub realtime: u64,
    pub original: String,
    pub patched:  String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChallengeOutcome {
    pub key_epoch:         u64,
    pub original_coverage: Option<u64>,
    pub patched_coverage:  Option<u64>,
    pub query_until:       u64,
    pub changed:           Vec<ChangedLine>,
}

pub struct Challenge<'a> {
    snapshots: &'a dyn SnapshotProvider,
    verifier:  &'a dyn SealVerifier,
}

impl<'a> Challenge<'a> {
    pub fn new(snapshots: &'a dyn SnapshotProvider, verifier: &'a dyn SealVerifier) -> Self {
        Self { snapshots, verifier }
    }

    pub fn run(
        &self,
        strategy: &mut dyn Strategy,
        log: &mut dyn LogAppender,
    ) -> std::result::Result<ChallengeOutcome, ChallengeError> {
        let stolen = self.snapshots.snapshot(KEY_FILE)?;
        let key = FsKey::from_checkpoint(stolen.as_bytes()).map_err(Error::from)?;
        info!(epoch = key.min_epoch(), "key checkpoint captured");

        strategy.interact(log)?;

        let original = self.snapshots.snapshot(JOURNAL_FILE)?;
        let mut patched = self.snapshots.writable_copy(JOURNAL_FILE, PATCHED_FILE)?;
        strategy.tamper(&mut patched, &key).map_err(AttackFailed::Aborted)?;
        self.snapshots.store(PATCHED_FILE, &patched)?;

        let original_coverage = self.verifier.sealed_coverage(&original)?;
        let patched_coverage = self.verifier.sealed_coverage(&patched).map_err(AttackFailed::Rejected)?;
        if patched_coverage < original_coverage {
            return Err(AttackFailed::SealedLess { original: original_coverage, patched: patched_coverage }.into());
        }

        let query_until = original_coverage.unwrap_or(0) + QUERY_SLACK_USEC;
        let before = self.verifier.query(&original, query_until)?;
        let after = self.verifier.query(&patched, query_until).map_err(AttackFailed::Rejected)?;
        if before == after {
            return Err(AttackFailed::OutputIdentical.into());
        }
        let changed = before
            .iter()
            .zip(&after)
            .filter(|(a, b)| a != b)
            .map(|(a, b)| ChangedLine { realtime: a.realtime, original: a.message.clone(), patched: b.message.clone() })
            .collect();

        info!(?original_coverage, ?patched_coverage, "attack succeeded");
        Ok(ChallengeOutcome { key_epoch: key.min_epoch(), original_coverage, patched_coverage, query_until, changed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000;

    fn secret() -> FsKey {
        FsKey::from_seed_bytes([11; 12], 50 * SEC, 60 * SEC)
    }

    fn writer_options() -> WriterOptions {
        WriterOptions { data_buckets: 16381, field_buckets: 509, ..Default::default() }
    }

    /// Logs and never tampers.
    struct Bystander;

    impl Strategy for Bystander {
        fn interact(&mut self, log: &mut dyn LogAppender) -> Result<()> {
            log.log("nothing to see here, just a long enough line")?;
            log.advance_epoch()?;
            log.log("tick")?;
            log.advance_epoch()
        }

        fn tamper(&mut self, _region: &mut Region, _key: &FsKey) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn forge_strategy_wins_the_challenge() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = DirectorySnapshots::new(dir.path()).unwrap();
        let mut journal = SimulatedJournal::new(secret(), writer_options(), snapshots.clone()).unwrap();
        let verifier = InProcessVerifier::new(secret(), VerifyOptions::default());

        let mut strategy = ForgeStrategy::default();
        let outcome = Challenge::new(&snapshots, &verifier).run(&mut strategy, &mut journal).unwrap();

        assert_eq!(outcome.key_epoch, 0);
        assert!(outcome.patched_coverage >= outcome.original_coverage);
        assert_eq!(outcome.changed.len(), 1);
        assert!(outcome.changed[0].patched.contains("Attacked"));
        assert_eq!(strategy.report().unwrap().forged_epoch, 0);
        assert!(snapshots.path(PATCHED_FILE).exists());
    }

    #[test]
    fn untouched_copy_fails_the_challenge() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = DirectorySnapshots::new(dir.path()).unwrap();
        let mut journal = SimulatedJournal::new(secret(), writer_options(), snapshots.clone()).unwrap();
        let verifier = InProcessVerifier::new(secret(), VerifyOptions::default());

        let err = Challenge::new(&snapshots, &verifier).run(&mut Bystander, &mut journal).unwrap_err();
        assert!(matches!(err, ChallengeError::Failed(AttackFailed::OutputIdentical)), "{err}");
    }

    #[test]
    fn simulated_journal_keeps_the_key_file_current() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = DirectorySnapshots::new(dir.path()).unwrap();
        let mut journal = SimulatedJournal::new(secret(), writer_options(), snapshots.clone()).unwrap();
        journal.log("first").unwrap();
        journal.advance_epoch().unwrap();
        journal.advance_epoch().unwrap();

        let key = FsKey::from_checkpoint(snapshots.snapshot(KEY_FILE).unwrap().as_bytes()).unwrap();
        assert_eq!(key.min_epoch(), 2);
        assert_eq!(journal.writer().current_epoch(), 2);
        let region = snapshots.snapshot(JOURNAL_FILE).unwrap();
        assert!(verify::verify(&region, &secret()).is_ok());
    }
}
