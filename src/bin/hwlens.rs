//! CLI binary for homework-lens.
//!
//! A thin shim over the library crate: maps flags to `ExtractionConfig`,
//! drives an `UploadSession` interactively and prints the local store.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use homework_lens::store::DEFAULT_QUOTA_BYTES;
use homework_lens::{
    build_extractor, compress_async, CompressionConfig, ExtractionConfig, ExtractionResult,
    FileBackend, GradeLevel, ImageFile, LocalStore, ProcessingStatus, QuestionRecord,
    SessionObserver, SessionStage, UploadSession,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── Session observer using indicatif ─────────────────────────────────────────

const SPINNER_TEMPLATE: &str = "{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}";

/// Spinner shown while a stage runs; cleared when the session waits for
/// the user or fails.
struct CliObserver {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliObserver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bar: Mutex::new(None),
        })
    }

    fn spinner(&self) -> Option<ProgressBar> {
        let mut slot = self.bar.lock().ok()?;
        let bar = slot.get_or_insert_with(|| {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template(SPINNER_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_spinner())
                    .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
            );
            bar.enable_steady_tick(Duration::from_millis(80));
            bar
        });
        Some(bar.clone())
    }

    fn clear(&self) {
        if let Some(bar) = self.bar.lock().ok().and_then(|mut b| b.take()) {
            bar.finish_and_clear();
        }
    }
}

impl SessionObserver for CliObserver {
    fn on_stage(&self, stage: SessionStage) {
        match stage {
            SessionStage::AwaitingDecision => self.clear(),
            other => {
                if let Some(bar) = self.spinner() {
                    bar.set_prefix(other.to_string());
                    bar.set_message("");
                }
            }
        }
    }

    fn on_attempt(&self, attempt: u32, max_attempts: u32) {
        if let Some(bar) = self.spinner() {
            bar.set_message(format!("attempt {attempt}/{max_attempts}"));
        }
    }

    fn on_retry(&self, attempt: u32, delay_ms: u64) {
        if let Some(bar) = self.spinner() {
            bar.println(format!(
                "  {} attempt {} failed, retrying in {}",
                cyan("⚠"),
                attempt,
                dim(&format!("{:.1}s", delay_ms as f64 / 1000.0)),
            ));
        }
    }

    fn on_error(&self, _error: &str) {
        self.clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract a question and review it interactively
  hwlens extract worksheet.jpg --grade high --subject Physics

  # Accept the extraction without prompting
  hwlens extract worksheet.png --yes

  # Browse the local store
  hwlens list
  hwlens show 3f1c…
  hwlens metrics --json

  # Downscale a photo the way stored images are compressed
  hwlens compress photo.jpg -o photo-small.jpg --max-dimension 800

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY      Vision API key; without it the offline mock is used
  HWLENS_MODEL        Override model ID (default gpt-4o)
  HWLENS_BASE_URL     OpenAI-compatible endpoint (default https://api.openai.com/v1)
  HWLENS_STORE_DIR    Where confirmed questions are kept
"#;

/// Extract homework questions from photos using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "hwlens",
    version,
    about = "Extract homework questions from photos using Vision LLMs",
    long_about = "Photograph a homework page, let a Vision Language Model pick out the first \
complete question while ignoring answers and marks, review it, and keep it in a local store. \
Works offline with a mock extractor when no API key is set.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory of the local question store.
    #[arg(long, global = true, env = "HWLENS_STORE_DIR")]
    store: Option<PathBuf>,

    /// Store capacity in bytes.
    #[arg(long, global = true, env = "HWLENS_QUOTA_BYTES", default_value_t = DEFAULT_QUOTA_BYTES)]
    quota_bytes: u64,

    /// Vision API key. Omit to use the offline mock.
    #[arg(long, global = true, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Vision model ID.
    #[arg(long, global = true, env = "HWLENS_MODEL")]
    model: Option<String>,

    /// OpenAI-compatible API base URL.
    #[arg(long, global = true, env = "HWLENS_BASE_URL")]
    base_url: Option<String>,

    /// Attempts per extraction.
    #[arg(long, global = true, env = "HWLENS_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Output JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "HWLENS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and results.
    #[arg(short, long, global = true, env = "HWLENS_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract the first question from a photo.
    Extract {
        /// JPEG, PNG or WebP image.
        file: PathBuf,

        /// Grade level used to guide the extraction.
        #[arg(long, value_enum, default_value = "middle")]
        grade: GradeArg,

        /// Subject tag stored with the question.
        #[arg(long)]
        subject: Option<String>,

        /// Save without asking for confirmation.
        #[arg(short, long)]
        yes: bool,

        /// Store a downscaled JPEG instead of the original image.
        #[arg(long)]
        compress: bool,
    },
    /// List stored questions.
    List,
    /// Print one stored question.
    Show { id: String },
    /// Confirm a stored question.
    Confirm { id: String },
    /// Delete a stored question.
    Delete { id: String },
    /// Delete every stored question.
    Clear {
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
    /// Show store usage.
    Metrics,
    /// Downscale an image to JPEG.
    Compress {
        file: PathBuf,

        /// Output file.
        #[arg(short, long)]
        output: PathBuf,

        /// Longest side in pixels.
        #[arg(long, default_value_t = homework_lens::config::MAX_IMAGE_DIMENSION)]
        max_dimension: u32,

        /// JPEG quality in (0, 1].
        #[arg(long, default_value_t = homework_lens::config::DEFAULT_JPEG_QUALITY)]
        quality: f32,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum GradeArg {
    Elementary,
    Middle,
    High,
}

impl From<GradeArg> for GradeLevel {
    fn from(v: GradeArg) -> Self {
        match v {
            GradeArg::Elementary => GradeLevel::Elementary,
            GradeArg::Middle => GradeLevel::Middle,
            GradeArg::High => GradeLevel::High,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner covers progress; only warnings unless asked otherwise.
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match &cli.command {
        Command::Extract {
            file,
            grade,
            subject,
            yes,
            compress,
        } => run_extract(&cli, file, (*grade).into(), subject.clone(), *yes, *compress).await,
        Command::List => run_list(&cli).await,
        Command::Show { id } => run_show(&cli, id).await,
        Command::Confirm { id } => {
            let mut store = open_store(&cli).await?;
            store.confirm(id).await.context("Confirm failed")?;
            if !cli.quiet {
                eprintln!("{} confirmed {}", green("✔"), bold(id));
            }
            Ok(())
        }
        Command::Delete { id } => {
            let mut store = open_store(&cli).await?;
            store.delete(id).await.context("Delete failed")?;
            if !cli.quiet {
                eprintln!("{} deleted {}", green("✔"), bold(id));
            }
            Ok(())
        }
        Command::Clear { yes } => {
            let mut store = open_store(&cli).await?;
            let n = store.container().questions.len();
            if !*yes && !ask_yes_no(&format!("Delete all {n} questions?"))? {
                return Ok(());
            }
            store.clear_all().await.context("Clear failed")?;
            if !cli.quiet {
                eprintln!("{} removed {} questions", green("✔"), n);
            }
            Ok(())
        }
        Command::Metrics => run_metrics(&cli).await,
        Command::Compress {
            file,
            output,
            max_dimension,
            quality,
        } => run_compress(&cli, file, output, *max_dimension, *quality).await,
    }
}

// ── Subcommands ──────────────────────────────────────────────────────────────

async fn run_extract(
    cli: &Cli,
    path: &Path,
    grade: GradeLevel,
    subject: Option<String>,
    yes: bool,
    compress: bool,
) -> Result<()> {
    let config = build_config(cli)?;
    let extractor = build_extractor(&config).context("Failed to set up extractor")?;
    if extractor.is_mock() && !cli.quiet {
        eprintln!(
            "{} no API key set, using the offline mock extractor",
            cyan("◆")
        );
    }

    let mut store = open_store(cli).await?;
    let photo = ImageFile::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut session = UploadSession::new(extractor);
    if !cli.quiet && !cli.json {
        session = session.with_observer(CliObserver::new());
    }
    if compress {
        session = session.with_compression(CompressionConfig::default());
    }

    let mut candidate = session
        .start(photo, grade)
        .await
        .context("Extraction failed")?
        .result
        .clone();

    loop {
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&candidate)?);
        } else {
            print_candidate(&candidate);
        }

        let decision = if yes {
            if candidate.is_failure() {
                bail!("No question could be extracted");
            }
            Decision::Save
        } else {
            ask_decision(!candidate.is_failure())?
        };

        match decision {
            Decision::Save => {
                let id = session
                    .confirm(&mut store, subject.clone())
                    .await
                    .context("Saving failed")?;
                if !cli.quiet {
                    eprintln!("{} saved as {}", green("✔"), bold(&id));
                }
                if cli.json {
                    println!("{}", serde_json::json!({ "id": id }));
                }
                return Ok(());
            }
            Decision::Retry => match session.retry().await {
                Ok(c) => candidate = c.result.clone(),
                Err(e) => eprintln!("{} {}", red("✗"), e),
            },
            Decision::Discard => {
                session.discard();
                if !cli.quiet {
                    eprintln!("{} discarded", dim("–"));
                }
                return Ok(());
            }
        }
    }
}

async fn run_list(cli: &Cli) -> Result<()> {
    let store = open_store(cli).await?;
    let records = store.get_all();

    if cli.json {
        let rows: Vec<ListRow<'_>> = records.iter().map(ListRow::from).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if records.is_empty() {
        eprintln!("{}", dim("No questions stored."));
        return Ok(());
    }
    for r in &records {
        println!(
            "{}  {:<8}  {:>4}  {}  {}",
            dim(&r.id),
            status_label(r.processing_status),
            format!("{:.0}%", r.confidence * 100.0),
            r.upload_timestamp.format("%Y-%m-%d %H:%M"),
            truncate(&r.extracted_text, 60),
        );
    }
    Ok(())
}

async fn run_show(cli: &Cli, id: &str) -> Result<()> {
    let store = open_store(cli).await?;
    let r = store.get_by_id(id).context("Lookup failed")?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(r)?);
        return Ok(());
    }

    println!("Id:           {}", r.id);
    println!("Status:       {}", status_label(r.processing_status));
    println!("Confidence:   {:.2}", r.confidence);
    println!("Noise:        {}", if r.noise_filtered { "filtered" } else { "none" });
    println!("Uploaded:     {}", r.upload_timestamp.to_rfc3339());
    if let Some(t) = r.confirmed_at {
        println!("Confirmed:    {}", t.to_rfc3339());
    }
    if let Some(g) = r.grade_level {
        println!("Grade:        {}", g);
    }
    if let Some(ref s) = r.subject {
        println!("Subject:      {}", s);
    }
    println!(
        "Image:        {} ({} bytes)",
        r.image.file_format, r.image.file_size
    );
    if let Some(ref e) = r.error_message {
        println!("Error:        {}", red(e));
    }
    println!();
    println!("{}", r.extracted_text);
    Ok(())
}

async fn run_metrics(cli: &Cli) -> Result<()> {
    let store = open_store(cli).await?;
    let m = store.metrics().await.context("Failed to compute metrics")?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&m)?);
        return Ok(());
    }
    println!("Questions:    {}", m.total);
    println!("  pending     {}", m.pending);
    println!("  success     {}", m.success);
    println!("  failed      {}", m.failed);
    println!("  confirmed   {}", m.confirmed);
    println!(
        "Storage:      {} / {} bytes ({:.2}%)",
        m.estimated_bytes, m.quota_bytes, m.usage_percent
    );
    Ok(())
}

async fn run_compress(
    cli: &Cli,
    input: &Path,
    output: &Path,
    max_dimension: u32,
    quality: f32,
) -> Result<()> {
    if !(quality > 0.0 && quality <= 1.0) {
        bail!("Quality must be in (0, 1], got {quality}");
    }
    let file = ImageFile::read(input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let config = CompressionConfig {
        max_dimension,
        ..CompressionConfig::default()
    }
    .with_quality(quality);

    let small = compress_async(&file, config)
        .await
        .context("Compression failed")?;
    let (_, bytes) = homework_lens::pipeline::encode::decode_data_url(&small.data_url)
        .context("Compression produced an invalid data URL")?;
    tokio::fs::write(output, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    if !cli.quiet {
        eprintln!(
            "{}  {}x{}  {} → {} bytes  →  {}",
            green("✔"),
            small.width,
            small.height,
            file.size(),
            small.byte_len,
            bold(&output.display().to_string()),
        );
    }
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Map CLI args to `ExtractionConfig`.
fn build_config(cli: &Cli) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .api_key_opt(cli.api_key.clone())
        .max_retries(cli.max_retries);
    if let Some(ref m) = cli.model {
        builder = builder.model(m.clone());
    }
    if let Some(ref u) = cli.base_url {
        builder = builder.base_url(u.clone());
    }
    builder.build().context("Invalid configuration")
}

async fn open_store(cli: &Cli) -> Result<LocalStore<FileBackend>> {
    let dir = match cli.store {
        Some(ref d) => d.clone(),
        None => dirs::data_dir()
            .context("No data directory on this platform; pass --store")?
            .join("homework-lens"),
    };
    let backend = FileBackend::new(&dir).with_capacity(cli.quota_bytes);
    LocalStore::initialize(backend)
        .await
        .with_context(|| format!("Failed to open store at {}", dir.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Save,
    Retry,
    Discard,
}

fn ask_decision(can_save: bool) -> Result<Decision> {
    let prompt = if can_save {
        "Save this question? [y]es / [r]etry / [n]o"
    } else {
        "Nothing to save. [r]etry / [n]o"
    };
    loop {
        match read_answer(prompt)?.as_str() {
            "y" | "yes" if can_save => return Ok(Decision::Save),
            "r" | "retry" => return Ok(Decision::Retry),
            "n" | "no" | "" => return Ok(Decision::Discard),
            _ => continue,
        }
    }
}

fn ask_yes_no(prompt: &str) -> Result<bool> {
    Ok(matches!(
        read_answer(&format!("{prompt} [y/N]"))?.as_str(),
        "y" | "yes"
    ))
}

fn read_answer(prompt: &str) -> Result<String> {
    eprint!("{} ", bold(prompt));
    io::stderr().flush().ok();
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;
    Ok(line.trim().to_lowercase())
}

fn print_candidate(r: &ExtractionResult) {
    if let Some(ref e) = r.error_message {
        eprintln!("{} {}", red("✗"), red(e));
        return;
    }
    eprintln!(
        "{} {}  {}",
        cyan("◆"),
        bold("Extracted question"),
        dim(&format!(
            "confidence {:.0}%{}",
            r.confidence * 100.0,
            if r.noise_filtered { ", noise filtered" } else { "" }
        )),
    );
    println!("{}", r.question_text);
}

fn status_label(s: ProcessingStatus) -> String {
    match s {
        ProcessingStatus::Success => green(s.as_str()),
        ProcessingStatus::Failed => red(s.as_str()),
        ProcessingStatus::Pending => cyan(s.as_str()),
    }
}

fn truncate(s: &str, max: usize) -> String {
    let line = s.lines().next().unwrap_or("");
    if line.chars().count() > max {
        let cut: String = line.chars().take(max - 1).collect();
        format!("{cut}\u{2026}")
    } else {
        line.to_string()
    }
}

/// `list --json` row; leaves out the image payload.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListRow<'a> {
    id: &'a str,
    processing_status: ProcessingStatus,
    confidence: f64,
    upload_timestamp: String,
    confirmed: bool,
    extracted_text: &'a str,
}

impl<'a> From<&'a QuestionRecord> for ListRow<'a> {
    fn from(r: &'a QuestionRecord) -> Self {
        Self {
            id: &r.id,
            processing_status: r.processing_status,
            confidence: r.confidence,
            upload_timestamp: r.upload_timestamp.to_rfc3339(),
            confirmed: r.is_confirmed(),
            extracted_text: &r.extracted_text,
        }
    }
}
