//! Full verification pass and the read-only queries built on it.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::fsprng::FsKey;
use crate::hashchain::HashTable;
use crate::header::FormatError;
use crate::object::{JournalScan, ObjectRecord};
use crate::seal::{MacChecker, SealError};
use crate::view::Region;

/// How tag epochs are checked against the realtimes of the entries they seal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EpochWindowCheck {
    /// Every sealed entry must fall inside its tag's epoch window.
    #[default]
    Strict,
    /// Sealed entries must only precede the end of the tag's window.  This is
    /// what the daemon's own verifier enforces.
    UpperBound,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    pub epoch_windows: EpochWindowCheck,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub file_id:              String,
    pub objects:              u64,
    pub entries:              u64,
    pub data_objects:         u64,
    pub field_objects:        u64,
    pub entry_arrays:         u64,
    pub tags:                 u64,
    /// Exclusive end of the last sealed byte range.
    pub sealed_until:         u64,
    /// Realtime of the last entry covered by a tag.
    pub last_sealed_realtime: Option<u64>,
    pub first_realtime:       Option<u64>,
    pub last_realtime:        Option<u64>,
    /// Entries after the last tag.
    pub unsealed_entries:     u64,
    pub first_epoch:          Option<u64>,
    pub last_epoch:           Option<u64>,
}

/// One line of query output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryLine {
    pub realtime: u64,
    pub message:  String,
}

pub fn verify(region: &Region, key: &FsKey) -> Result<VerifyReport> {
    verify_with(region, key, &VerifyOptions::default())
}

/// Scan the whole file with a strict seal checker and cross-check every
/// index against the scan.
pub fn verify_with(region: &Region, key: &FsKey, options: &VerifyOptions) -> Result<VerifyReport> {
    let mut scan = JournalScan::open(region)?;
    let header = scan.header().clone();
    let mut checker = MacChecker::new(key.clone(), &header, region.view());
    let mut report = VerifyReport { file_id: header.file_id.to_string(), ..Default::default() };

    // Realtime range of entries since the last tag.
    let mut window: Option<(u64, u64)> = None;
    while let Some(record) = scan.next(region, Some(&mut checker))? {
        report.objects += 1;
        match record {
            ObjectRecord::Entry(e) => {
                report.entries += 1;
                report.unsealed_entries += 1;
                report.first_realtime.get_or_insert(e.realtime);
                report.last_realtime = Some(e.realtime);
                window = Some(match window {
                    Some((lo, _)) => (lo, e.realtime),
                    None => (e.realtime, e.realtime),
                });
            }
            ObjectRecord::Tag(t) => {
                report.tags += 1;
                if let Some(previous) = report.last_epoch {
                    if t.epoch < previous {
                        return Err(SealError::EpochOutOfOrder { offset: t.offset, previous, epoch: t.epoch }.into());
                    }
                }
                if let Some((lo, hi)) = window.take() {
                    check_window(key, options.epoch_windows, lo, hi, t.epoch)?;
                    report.last_sealed_realtime = Some(hi);
                }
                report.unsealed_entries = 0;
                report.sealed_until = checker.sealed_until();
                report.first_epoch.get_or_insert(t.epoch);
                report.last_epoch = Some(t.epoch);
            }
            ObjectRecord::Data(_) => report.data_objects += 1,
            ObjectRecord::Field(_) => report.field_objects += 1,
            ObjectRecord::EntryArray(_) => report.entry_arrays += 1,
            ObjectRecord::Other { .. } => {}
        }
    }

    let counts = [
        ("total", header.n_objects, report.objects),
        ("entry", header.n_entries, report.entries),
        ("data", header.n_data, report.data_objects),
        ("field", header.n_fields, report.field_objects),
        ("tag", header.n_tags, report.tags),
        ("entry array", header.n_entry_arrays, report.entry_arrays),
    ];
    for (kind, declared, found) in counts {
        if declared != found {
            return Err(FormatError::HeaderCountMismatch { kind, declared, found }.into());
        }
    }

    HashTable::data(&header, region)?.verify(region, scan.index().data_objects())?;
    HashTable::field(&header, region)?.verify(region, scan.index().field_objects())?;

    if report.unsealed_entries > 0 {
        warn!(entries = report.unsealed_entries, "entries after the last tag are not sealed");
    }
    info!(
        entries = report.entries,
        tags = report.tags,
        sealed_until = report.sealed_until,
        "journal verified"
    );
    Ok(report)
}

fn check_window(key: &FsKey, mode: EpochWindowCheck, lo: u64, hi: u64, epoch: u64) -> Result<()> {
    match mode {
        EpochWindowCheck::Strict => key.validate_epoch(lo, hi, epoch)?,
        EpochWindowCheck::UpperBound => {
            let (start, end) = key.epoch_window(epoch);
            if hi >= end {
                return Err(SealError::EpochWindowViolation {
                    epoch,
                    window_start: start,
                    window_end: end,
                    min_realtime: lo,
                    max_realtime: hi,
                }
                .into());
            }
        }
    }
    Ok(())
}

/// "Sealed up to" realtime of a file that verifies under `key`.
pub fn sealed_coverage(region: &Region, key: &FsKey, options: &VerifyOptions) -> Result<Option<u64>> {
    Ok(verify_with(region, key, options)?.last_sealed_realtime)
}

/// `MESSAGE=` values of every entry with `realtime <= until`, in file order.
pub fn query(region: &Region, until: u64) -> Result<Vec<QueryLine>> {
    let mut scan = JournalScan::open(region)?;
    let mut out = Vec::new();
    while let Some(record) = scan.next(region, None)? {
        let ObjectRecord::Entry(e) = record else { continue };
        if e.realtime > until {
            break;
        }
        for (_, data) in scan.index().entry_data(&e) {
            let Some(data) = data else { continue };
            let text = data.payload_text()?;
            if let Some(message) = text.strip_prefix(b"MESSAGE=".as_slice()) {
                out.push(QueryLine {
                    realtime: e.realtime,
                    message:  String::from_utf8_lossy(message).into_owned(),
                });
            }
        }
    }
    Ok(out)
}
