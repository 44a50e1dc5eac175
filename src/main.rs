use clap::{Parser, Subcommand};
use sealbreak::attack::{AttackOptions, Attacker};
use sealbreak::fsprng::{format_usec, FsKey, DEFAULT_INTERVAL_USEC};
use sealbreak::harness::{
    Challenge, DirectorySnapshots, ForgeStrategy, InProcessVerifier, SimulatedJournal, JOURNAL_FILE, PATCHED_FILE,
};
use sealbreak::object::{JournalScan, ObjectRecord};
use sealbreak::verify::{self, EpochWindowCheck, VerifyOptions};
use sealbreak::writer::WriterOptions;
use sealbreak::Region;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sealbreak", about = "Inspect, verify and tamper with sealed journal files")]
struct Cli {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the file header
    Info {
        input: PathBuf,
    },
    /// List every object in file order
    Dump {
        input: PathBuf,
    },
    /// Verify hash tables and the seal chain
    Verify {
        input: PathBuf,
        /// Verification key as printed by setup-keys
        #[arg(long, conflicts_with = "checkpoint", required_unless_present = "checkpoint")]
        key: Option<String>,
        /// Key checkpoint file
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Only require sealed entries to precede their tag's epoch end
        #[arg(long)]
        lax_windows: bool,
    },
    /// Print MESSAGE= values up to a realtime (microseconds)
    Query {
        input: PathBuf,
        #[arg(long)]
        until: Option<u64>,
    },
    /// Rewrite the last usable sealed message and forge its tag
    Tamper {
        input: PathBuf,
        /// Key checkpoint file whose epoch is behind the file's seal
        #[arg(long)]
        checkpoint: PathBuf,
        /// Output path (default: <input>.patched)
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, default_value = "Attacked")]
        replacement: String,
        /// Payload index the replacement starts at
        #[arg(long, default_value = "11")]
        at: usize,
    },
    /// Generate a sealing key, write its checkpoint and print the verification key
    SetupKeys {
        #[arg(short, long, default_value = "fss")]
        output: PathBuf,
        /// Epoch length in seconds
        #[arg(long, default_value = "900")]
        interval: u64,
    },
    /// Run the simulated tamper challenge end to end
    Challenge {
        #[arg(short = 'C', long, default_value = "challenge")]
        dir: PathBuf,
        /// Sealing key (default: a fresh one)
        #[arg(long)]
        key: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let json = cli.json;
    match cli.command {

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let region = Region::open(&input)?;
            let scan = JournalScan::open(&region)?;
            let h = scan.header();
            if json {
                return print_json(&HeaderSummary::from(h));
            }
            println!("── Journal ──────────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  File ID        {}", h.file_id);
            println!("  Machine ID     {}", h.machine_id);
            println!("  Sealed         {}", h.is_sealed());
            println!("  Keyed hash     {}", h.is_keyed_hash());
            println!("  Header size    {} B", h.header_size);
            println!("  Arena size     {} B", h.arena_size);
            println!("  Objects        {}", h.n_objects);
            println!("  Entries        {}", h.n_entries);
            println!("  Data / fields  {} / {}", h.n_data, h.n_fields);
            println!("  Tags           {}", h.n_tags);
            if h.n_entries > 0 {
                println!("  Head entry     {}", format_usec(h.head_entry_realtime));
                println!("  Tail entry     {}", format_usec(h.tail_entry_realtime));
            }
        }

        // ── Dump ─────────────────────────────────────────────────────────────
        Commands::Dump { input } => {
            let region = Region::open(&input)?;
            let mut scan = JournalScan::open(&region)?;
            let mut rows = Vec::new();
            while let Some(record) = scan.next(&region, None)? {
                rows.push(DumpRow::new(&record, scan.index()));
            }
            if json {
                return print_json(&rows);
            }
            for r in &rows {
                println!("{:>10}  {:<16} {}", r.offset, r.kind, r.detail);
            }
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { input, key, checkpoint, lax_windows } => {
            let region = Region::open(&input)?;
            let key = load_key(key.as_deref(), checkpoint.as_deref())?;
            let options = VerifyOptions {
                epoch_windows: if lax_windows { EpochWindowCheck::UpperBound } else { EpochWindowCheck::Strict },
            };
            let report = verify::verify_with(&region, &key, &options)?;
            if json {
                return print_json(&report);
            }
            match (report.first_realtime, report.last_sealed_realtime) {
                (Some(first), Some(sealed)) => println!(
                    "PASS: {}\n=> Validated from {} to {}, final {} entries not sealed.",
                    input.display(),
                    format_usec(first),
                    format_usec(sealed),
                    report.unsealed_entries
                ),
                _ => println!("PASS: {} ({} entries, nothing sealed)", input.display(), report.entries),
            }
        }

        // ── Query ────────────────────────────────────────────────────────────
        Commands::Query { input, until } => {
            let region = Region::open(&input)?;
            let lines = verify::query(&region, until.unwrap_or(u64::MAX))?;
            if json {
                return print_json(&lines);
            }
            for l in &lines {
                println!("{}  {}", format_usec(l.realtime), l.message);
            }
        }

        // ── Tamper ───────────────────────────────────────────────────────────
        Commands::Tamper { input, checkpoint, output, replacement, at } => {
            let key = load_key(None, Some(&checkpoint))?;
            let output = output.unwrap_or_else(|| {
                let mut p = input.clone().into_os_string();
                p.push(".patched");
                PathBuf::from(p)
            });
            let mut region = Region::open(&input)?;
            let options = AttackOptions { replacement: replacement.into_bytes(), replace_at: at, ..Default::default() };
            let report = Attacker::new(key, options).tamper(&mut region)?;
            region.save(&output)?;
            if json {
                return print_json(&report);
            }
            println!("Tampered entry at {} ({})", report.entry_offset, format_usec(report.realtime));
            println!("  before  {}", report.original_payload);
            println!("  after   {}", report.forged_payload);
            println!("  tag     {} epoch {} → {}", report.tag_offset, report.original_epoch, report.forged_epoch);
            println!("Written: {}", output.display());
        }

        // ── SetupKeys ────────────────────────────────────────────────────────
        Commands::SetupKeys { output, interval } => {
            let key = FsKey::generate(interval.saturating_mul(1_000_000), now_usec());
            let bytes = key.to_checkpoint(key.min_epoch(), uuid::Uuid::new_v4(), uuid::Uuid::new_v4())?;
            std::fs::write(&output, bytes)?;
            let verification = key.verification_key().unwrap_or_default();
            if json {
                return print_json(&serde_json::json!({
                    "checkpoint": output.display().to_string(),
                    "verification_key": verification,
                }));
            }
            println!("Checkpoint written: {}", output.display());
            println!("Verification key: {verification}");
        }

        // ── Challenge ────────────────────────────────────────────────────────
        Commands::Challenge { dir, key } => {
            let key = match key {
                Some(text) => FsKey::from_seed(&text)?,
                None => FsKey::generate(DEFAULT_INTERVAL_USEC, now_usec()),
            };
            let snapshots = DirectorySnapshots::new(&dir)?;
            let mut journal = SimulatedJournal::new(key.clone(), WriterOptions::default(), snapshots.clone())?;
            let verifier = InProcessVerifier::new(key.clone(), VerifyOptions::default());
            let mut strategy = ForgeStrategy::default();
            let outcome = Challenge::new(&snapshots, &verifier).run(&mut strategy, &mut journal)?;
            if json {
                return print_json(&outcome);
            }
            println!("Attack succeeded with a key checkpoint of epoch {}", outcome.key_epoch);
            for c in &outcome.changed {
                println!("  {}  {:?} → {:?}", format_usec(c.realtime), c.original, c.patched);
            }
            println!("Original: {}", snapshots.path(JOURNAL_FILE).display());
            println!("Patched:  {}", snapshots.path(PATCHED_FILE).display());
            if let Some(v) = key.verification_key() {
                println!("Verification key: {v}");
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn load_key(seed: Option<&str>, checkpoint: Option<&Path>) -> Result<FsKey, Box<dyn std::error::Error>> {
    Ok(match (seed, checkpoint) {
        (Some(text), _) => FsKey::from_seed(text)?,
        (None, Some(path)) => FsKey::from_checkpoint(&std::fs::read(path)?)?,
        (None, None) => return Err("either --key or --checkpoint is required".into()),
    })
}

fn now_usec() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or(0)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct HeaderSummary {
    file_id:             String,
    machine_id:          String,
    sealed:              bool,
    keyed_hash:          bool,
    header_size:         u64,
    arena_size:          u64,
    n_objects:           u64,
    n_entries:           u64,
    n_data:              u64,
    n_fields:            u64,
    n_tags:              u64,
    head_entry_realtime: u64,
    tail_entry_realtime: u64,
}

impl From<&sealbreak::JournalHeader> for HeaderSummary {
    fn from(h: &sealbreak::JournalHeader) -> Self {
        Self {
            file_id:             h.file_id.to_string(),
            machine_id:          h.machine_id.to_string(),
            sealed:              h.is_sealed(),
            keyed_hash:          h.is_keyed_hash(),
            header_size:         h.header_size,
            arena_size:          h.arena_size,
            n_objects:           h.n_objects,
            n_entries:           h.n_entries,
            n_data:              h.n_data,
            n_fields:            h.n_fields,
            n_tags:              h.n_tags,
            head_entry_realtime: h.head_entry_realtime,
            tail_entry_realtime: h.tail_entry_realtime,
        }
    }
}

#[derive(Serialize)]
struct DumpRow {
    offset: u64,
    kind:   &'static str,
    detail: String,
}

impl DumpRow {
    fn new(record: &ObjectRecord, index: &sealbreak::ObjectIndex) -> Self {
        let detail = match record {
            ObjectRecord::Data(d) => {
                let text = d.payload_text().map(|t| String::from_utf8_lossy(&t).into_owned()).unwrap_or_default();
                format!("hash={:016x} entries={} {:?}", d.hash, d.n_entries, text)
            }
            ObjectRecord::Field(f) => format!("hash={:016x} {:?}", f.hash, String::from_utf8_lossy(&f.payload)),
            ObjectRecord::Entry(e) => {
                let messages: Vec<String> = index
                    .entry_data(e)
                    .filter_map(|(_, d)| d)
                    .filter_map(|d| d.payload_text().ok().map(|t| String::from_utf8_lossy(&t).into_owned()))
                    .filter(|t| t.starts_with("MESSAGE="))
                    .collect();
                format!("seqnum={} realtime={} items={} {}", e.seqnum, format_usec(e.realtime), e.items.len(), messages.join(" "))
            }
            ObjectRecord::EntryArray(a) => format!("next={} used={}", a.next_array_offset, a.entries().count()),
            ObjectRecord::Tag(t) => format!("seqnum={} epoch={} mac={}", t.seqnum, t.epoch, hex::encode(t.mac)),
            ObjectRecord::Other { size, .. } => format!("size={size}"),
        };
        Self { offset: record.offset(), kind: record.kind_name(), detail }
    }
}
