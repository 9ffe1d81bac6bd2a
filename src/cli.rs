//! The `record-ingest` command: imports JSON-lines candidate files into a directory-backed record store.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::CommandFactory;
use clap::Parser;
use fieldx::fxstruct;
use garde::Validate;
use indicatif::ProgressBar;
use indicatif::ProgressStyle;
use num_format::Locale;
use num_format::ToFormattedString;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tracing::info;
use tracing::warn;

use crate::backend::FsStore;
use crate::candidate::CandidateRecord;
use crate::candidate::SourceFile;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::ingest::IngestPipeline;
use crate::store::RecordStore;
use crate::types::Progress;
use crate::types::SourceSystem;

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "RECORD_STORE_LOG";

#[derive(Debug, Clone, clap::Parser, Validate)]
#[fxstruct(no_new, get(copy))]
#[clap(about, version, author, name = "record-ingest")]
pub struct Cli {
    /// JSON-lines files with one candidate record per line.
    #[clap(required = true)]
    #[fieldx(get(clone))]
    #[garde(length(min = 1))]
    files: Vec<PathBuf>,

    /// Directory of the record store. Created if missing.
    #[clap(long, short, env = "RECORD_STORE_DIR", default_value = "records")]
    #[fieldx(get(copy(off)))]
    #[garde(skip)]
    store: PathBuf,

    /// Source system of candidates that don't name one.
    #[clap(long, env = "RECORD_STORE_SOURCE", default_value = "aws")]
    #[garde(skip)]
    source: SourceSystem,

    /// Staged records written concurrently per batch.
    #[clap(long, default_value_t = 1000)]
    #[garde(range(min = 1))]
    batch_size: usize,

    /// Quiet period, in milliseconds, before coalesced writes are flushed.
    #[clap(long, default_value_t = 200)]
    #[garde(range(min = 1))]
    debounce_ms: u64,

    /// Give up on the import after this many minutes.
    #[clap(long, default_value_t = 30)]
    #[garde(range(min = 1, max = 1440))]
    timeout_minutes: u64,

    /// Wipe the store before importing.
    #[clap(long)]
    #[garde(skip)]
    reset: bool,

    /// Don't draw the progress bar.
    #[clap(long, short)]
    #[garde(skip)]
    quiet: bool,
}

impl Cli {
    fn validated() -> Self {
        let cli = Self::parse();
        if let Err(err) = cli.validate() {
            let mut cmd = Self::command();
            cmd.error(ErrorKind::InvalidValue, err).exit();
        }
        cli
    }

    fn store_config(&self) -> Result<StoreConfig, StoreError> {
        StoreConfig::builder()
            .debounce(Duration::from_millis(self.debounce_ms()))
            .ingest_batch_size(self.batch_size())
            .flush_batch_size(self.batch_size())
            .ingest_timeout(Duration::from_secs(self.timeout_minutes() * 60))
            .default_source_system(self.source())
            .build()
            .map_err(|err| StoreError::Config(err.to_string()))
    }
}

fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;
    Ok(())
}

/// Read a JSON-lines file. Blank lines are ignored; lines that don't parse are logged and counted.
pub async fn read_source_file(path: &Path) -> anyhow::Result<(SourceFile, usize)> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {}", path.display()))?;

    let mut lines = BufReader::new(file).lines();
    let mut candidates = Vec::new();
    let mut malformed = 0;
    let mut line_no = 0;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<CandidateRecord>(trimmed) {
            Ok(candidate) => candidates.push(candidate),
            Err(err) => {
                warn!(file = %path.display(), line = line_no, %err, "malformed candidate, skipping");
                malformed += 1;
            }
        }
    }

    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok((SourceFile::new(name, candidates), malformed))
}

fn progress_bar(total: usize, quiet: bool) -> anyhow::Result<Option<ProgressBar>> {
    if quiet {
        return Ok(None);
    }
    let style = ProgressStyle::default_bar()
        .template("[{elapsed_precise:.cyan}] {bar:30.cyan.on_240} {pos:>7}/{len:7} {msg}")?
        .progress_chars("█▉▊▋▌▍▎▏ ");
    Ok(Some(ProgressBar::new(total as u64).with_style(style)))
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::validated();
    init_tracing()?;

    let started = Instant::now();
    let mut files = Vec::with_capacity(cli.files().len());
    let mut malformed = 0;
    for path in cli.files() {
        let (file, bad_lines) = read_source_file(&path).await?;
        malformed += bad_lines;
        files.push(file);
    }
    let total: usize = files.iter().map(|f| f.candidates.len()).sum();

    let backend = Arc::new(FsStore::open(cli.store()).await?);
    let store = RecordStore::open(backend, cli.store_config()?);
    if cli.reset() {
        store.clear().await?;
        info!(store = %cli.store().display(), "record store wiped");
    }

    let pipeline = IngestPipeline::new(store.clone());
    let pb = progress_bar(total, cli.quiet())?;
    let summary = pipeline
        .ingest_files(files, |progress: Progress| {
            if let Some(pb) = &pb {
                pb.set_position(progress.current as u64);
                pb.set_message(format!("{} {}", progress.status, progress.current_item));
            }
        })
        .await?;
    if let Some(pb) = &pb {
        pb.finish_with_message("done");
    }
    store.close().await?;

    let accepted = total.saturating_sub(summary.skipped_count);
    println!(
        "{} of {} records imported in {:.2}s",
        accepted.to_formatted_string(&Locale::en),
        (total + malformed).to_formatted_string(&Locale::en),
        started.elapsed().as_secs_f64()
    );
    println!(
        "{} new, {} updated, {} unchanged, {} skipped, {} unique",
        summary.new_count.to_formatted_string(&Locale::en),
        summary.updated_count.to_formatted_string(&Locale::en),
        summary.unchanged_count.to_formatted_string(&Locale::en),
        (summary.skipped_count + malformed).to_formatted_string(&Locale::en),
        summary.unique_count.to_formatted_string(&Locale::en),
    );
    if summary.failed_writes > 0 {
        warn!(failed = summary.failed_writes, "some writes needed a retry");
    }

    Ok(())
}
