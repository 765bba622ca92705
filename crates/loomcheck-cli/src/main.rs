use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use loomcheck_contracts::events::{EventWriter, InspectionEvent};
use loomcheck_contracts::extraction::extract_structured_output;
use loomcheck_contracts::history::{ArchivedReport, ReportArchive};
use loomcheck_contracts::prompt::SYSTEM_PROMPT;
use loomcheck_contracts::report::{InspectionMeta, LotStatus};
use loomcheck_engine::{
    CancelToken, Config, ImageSource, InspectError, InspectionOutcome, InspectionPipeline,
    ReferenceStandards,
};
use serde_json::{json, Value};

const DEFAULT_ARCHIVE: &str = "loomcheck-reports.json";

#[derive(Debug, Parser)]
#[command(name = "loomcheck", version, about = "Textile lot inspection with a vision model")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Inspect a lot from one or more images and save the report.
    Analyze(AnalyzeArgs),
    /// Re-inspect a saved lot with additional images.
    Append(AppendArgs),
    /// Override the lot verdict of a saved report.
    Review(ReviewArgs),
    /// List saved reports, newest first.
    History(HistoryArgs),
    /// Run the output extractor over a saved model response.
    Extract(ExtractArgs),
    /// Print the system instruction sent with every request.
    Prompt,
}

#[derive(Debug, Args)]
struct StoreArgs {
    #[arg(long, default_value = DEFAULT_ARCHIVE)]
    archive: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ModelArgs {
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    max_retries: Option<u32>,
    /// Per-request timeout in seconds.
    #[arg(long)]
    timeout: Option<f64>,
}

#[derive(Debug, Args)]
struct ReferenceArgs {
    #[arg(long = "accepted-ref")]
    accepted: Vec<PathBuf>,
    #[arg(long = "rejected-ref")]
    rejected: Vec<PathBuf>,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    supplier: String,
    #[arg(long)]
    po: String,
    #[arg(long)]
    inspector: String,
    #[arg(long)]
    batch: Option<String>,
    #[arg(long)]
    lot: Option<String>,
    #[arg(long)]
    item: Option<String>,
    #[arg(long)]
    station: Option<String>,
    #[arg(long)]
    date: Option<String>,
    #[arg(long)]
    notes: Option<String>,
    #[command(flatten)]
    references: ReferenceArgs,
    #[command(flatten)]
    model: ModelArgs,
    #[command(flatten)]
    store: StoreArgs,
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

#[derive(Debug, Parser)]
struct AppendArgs {
    /// Report key, `PO@timestamp`.
    #[arg(long)]
    report: String,
    #[command(flatten)]
    references: ReferenceArgs,
    #[command(flatten)]
    model: ModelArgs,
    #[command(flatten)]
    store: StoreArgs,
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

#[derive(Debug, Parser)]
struct ReviewArgs {
    #[arg(long)]
    report: String,
    #[arg(long, value_parser = parse_lot_status)]
    status: LotStatus,
    #[arg(long)]
    reviewer: String,
    #[command(flatten)]
    store: StoreArgs,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[arg(long)]
    supplier: Option<String>,
    #[arg(long)]
    json: bool,
    #[command(flatten)]
    store: StoreArgs,
}

#[derive(Debug, Parser)]
struct ExtractArgs {
    /// File holding raw model output; `-` reads stdin.
    input: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("loomcheck error: {}", describe_error(&err));
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Analyze(args) => run_analyze(args),
        Command::Append(args) => run_append(args),
        Command::Review(args) => run_review(args),
        Command::History(args) => run_history(args),
        Command::Extract(args) => run_extract(args),
        Command::Prompt => {
            println!("{SYSTEM_PROMPT}");
            Ok(0)
        }
    }
}

/// One line for the operator. Engine errors use their own wording so quota
/// exhaustion reads differently from other failures.
fn describe_error(err: &anyhow::Error) -> String {
    match err.downcast_ref::<InspectError>() {
        Some(inspect) => inspect.user_message(),
        None => format!("{err:#}"),
    }
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let meta = InspectionMeta {
        supplier_name: args.supplier,
        po_number: args.po,
        batch_number: args.batch,
        lot_number: args.lot,
        inspector_name: args.inspector,
        item_name: args.item,
        work_station: args.station,
        inspection_date: args.date,
        notes: args.notes,
    };
    let standards = reference_standards(&args.references, meta.item_name.clone());
    let pipeline = build_pipeline(&args.model, &args.store)?;
    let mut archive = ReportArchive::new(&args.store.archive);
    let history = archive.reports()?;

    let sources = image_sources(&args.images);
    let outcome = pipeline.analyze(
        &sources,
        &meta,
        &history,
        standards.as_ref(),
        &CancelToken::new(),
    )?;
    save_and_print(&mut archive, outcome, &args.images)
}

fn run_append(args: AppendArgs) -> Result<i32> {
    let mut archive = ReportArchive::new(&args.store.archive);
    let existing = archive
        .get(&args.report)?
        .ok_or_else(|| anyhow!("no saved report with key '{}'", args.report))?;
    let history = archive.reports()?;

    let image_paths = merged_image_paths(&existing.image_paths, &args.images);
    let standards = reference_standards(
        &args.references,
        existing.report.inspection_header.item_name.clone(),
    );
    let pipeline = build_pipeline(&args.model, &args.store)?;
    let outcome = pipeline.append(
        &existing.report,
        &image_sources(&image_paths),
        &history,
        standards.as_ref(),
        &CancelToken::new(),
    )?;
    save_and_print(&mut archive, outcome, &image_paths)
}

fn run_review(args: ReviewArgs) -> Result<i32> {
    let mut archive = ReportArchive::new(&args.store.archive);
    let record = archive.update_lot_status(&args.report, args.status, &args.reviewer)?;
    if let Some(path) = &args.store.events {
        let events = EventWriter::new(path, new_session_id());
        events.emit(&InspectionEvent::LotStatusUpdated {
            report_key: args.report.clone(),
            lot_status: record.report.lot_assessment.lot_status,
            previous_status: record
                .report
                .lot_assessment
                .review
                .as_ref()
                .map(|review| review.previous_status),
            reviewer: args.reviewer.clone(),
        })?;
    }
    println!(
        "{} -> {}",
        args.report, record.report.lot_assessment.lot_status
    );
    Ok(0)
}

fn run_history(args: HistoryArgs) -> Result<i32> {
    let mut archive = ReportArchive::new(&args.store.archive);
    let rows: Vec<ArchivedReport> = archive
        .list()?
        .into_iter()
        .filter(|row| matches_supplier(row, args.supplier.as_deref()))
        .collect();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(0);
    }
    if rows.is_empty() {
        println!("no saved reports");
        return Ok(0);
    }
    for row in &rows {
        println!("{}", history_line(row));
    }
    Ok(0)
}

fn run_extract(args: ExtractArgs) -> Result<i32> {
    let raw = read_input(&args.input)?;
    let output = extract_structured_output(&raw)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "payload": Value::Object(output.payload),
            "summary": output.summary,
        }))?
    );
    Ok(0)
}

fn build_pipeline(model: &ModelArgs, store: &StoreArgs) -> Result<InspectionPipeline> {
    let config = resolve_config(Config::from_env()?, model);
    let pipeline = InspectionPipeline::from_config(config);
    Ok(match &store.events {
        Some(path) => pipeline.with_events(EventWriter::new(path, new_session_id())),
        None => pipeline,
    })
}

/// Flags override the environment.
fn resolve_config(mut config: Config, args: &ModelArgs) -> Config {
    if let Some(key) = &args.api_key {
        config = config.with_api_key(key.clone());
    }
    if let Some(model) = &args.model {
        config = config.with_model(model.clone());
    }
    if let Some(max_retries) = args.max_retries {
        config.retry.max_retries = max_retries;
    }
    if let Some(timeout) = args.timeout.filter(|value| value.is_finite() && *value > 0.0) {
        config = config.with_request_timeout(Duration::from_secs_f64(timeout));
    }
    config
}

fn reference_standards(
    args: &ReferenceArgs,
    item_name: Option<String>,
) -> Option<ReferenceStandards> {
    if args.accepted.is_empty() && args.rejected.is_empty() {
        return None;
    }
    Some(ReferenceStandards {
        item_name,
        accepted: image_sources(&args.accepted),
        rejected: image_sources(&args.rejected),
    })
}

fn image_sources(paths: &[PathBuf]) -> Vec<ImageSource> {
    paths
        .iter()
        .map(|path| ImageSource::from(path.as_path()))
        .collect()
}

/// Previously inspected images first, then new ones not already present.
fn merged_image_paths(previous: &[String], added: &[PathBuf]) -> Vec<PathBuf> {
    let mut merged: Vec<PathBuf> = previous.iter().map(PathBuf::from).collect();
    for path in added {
        if !merged.contains(path) {
            merged.push(path.clone());
        }
    }
    merged
}

fn save_and_print(
    archive: &mut ReportArchive,
    outcome: InspectionOutcome,
    image_paths: &[PathBuf],
) -> Result<i32> {
    for warning in &outcome.warnings {
        eprintln!("warning: {warning}");
    }
    let key = archive
        .upsert(ArchivedReport {
            report: outcome.report.clone(),
            summary: outcome.summary.clone(),
            image_paths: image_paths
                .iter()
                .map(|path| path.to_string_lossy().to_string())
                .collect(),
            saved_at: String::new(),
        })
        .with_context(|| format!("failed to save report to {}", archive.path().display()))?;
    eprintln!("saved {key}");
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(if outcome.report.is_rejected() { 2 } else { 0 })
}

fn history_line(row: &ArchivedReport) -> String {
    let header = &row.report.inspection_header;
    let reviewed = row
        .report
        .lot_assessment
        .review
        .as_ref()
        .map(|review| format!(" (reviewed by {})", review.reviewer))
        .unwrap_or_default();
    format!(
        "{}  {}  {}  {:.2}% defective  {}{}",
        row.report.report_key(),
        header.supplier_name,
        header.inspector_name,
        row.report.defect_rate_percent(),
        row.report.lot_assessment.lot_status,
        reviewed
    )
}

fn matches_supplier(row: &ArchivedReport, supplier: Option<&str>) -> bool {
    match supplier.map(str::trim).filter(|value| !value.is_empty()) {
        Some(wanted) => row
            .report
            .inspection_header
            .supplier_name
            .trim()
            .eq_ignore_ascii_case(wanted),
        None => true,
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("failed reading model output from stdin")?;
        return Ok(buffer);
    }
    fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))
}

fn parse_lot_status(raw: &str) -> std::result::Result<LotStatus, String> {
    raw.parse::<LotStatus>()
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;
    use loomcheck_contracts::history::{ArchivedReport, ReportArchive};
    use loomcheck_contracts::report::{InspectionReport, LotStatus};
    use loomcheck_engine::{Config, InspectError};

    use super::*;

    fn archived(po: &str, supplier: &str, timestamp: &str) -> ArchivedReport {
        let mut report = InspectionReport::default();
        report.inspection_header.po_number = po.to_string();
        report.inspection_header.supplier_name = supplier.to_string();
        report.inspection_header.inspector_name = "R. Osei".to_string();
        report.inspection_header.report_timestamp = timestamp.to_string();
        ArchivedReport {
            report,
            summary: "ok".to_string(),
            image_paths: vec!["a.jpg".to_string()],
            saved_at: String::new(),
        }
    }

    #[test]
    fn analyze_args_parse_with_references() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "loomcheck",
            "analyze",
            "--supplier",
            "Acme Mills",
            "--po",
            "PO-7",
            "--inspector",
            "R. Osei",
            "--accepted-ref",
            "good.jpg",
            "--rejected-ref",
            "bad.jpg",
            "--max-retries",
            "1",
            "one.jpg",
            "two.jpg",
        ])?;
        let Command::Analyze(args) = cli.command else {
            anyhow::bail!("expected analyze");
        };
        assert_eq!(args.images.len(), 2);
        assert_eq!(args.store.archive, PathBuf::from(DEFAULT_ARCHIVE));
        let standards = reference_standards(&args.references, Some("jacket".to_string()));
        assert_eq!(standards.map(|s| s.len()), Some(2));

        let config = resolve_config(Config::default(), &args.model);
        assert_eq!(config.retry.max_retries, 1);
        Ok(())
    }

    #[test]
    fn analyze_requires_images_and_review_validates_status() {
        assert!(Cli::try_parse_from([
            "loomcheck",
            "analyze",
            "--supplier",
            "s",
            "--po",
            "p",
            "--inspector",
            "i"
        ])
        .is_err());

        assert!(Cli::try_parse_from([
            "loomcheck",
            "review",
            "--report",
            "PO-7@t",
            "--status",
            "maybe",
            "--reviewer",
            "QA"
        ])
        .is_err());

        let parsed = Cli::try_parse_from([
            "loomcheck",
            "review",
            "--report",
            "PO-7@t",
            "--status",
            "Accept With Remarks",
            "--reviewer",
            "QA",
        ]);
        assert!(matches!(
            parsed.map(|cli| cli.command),
            Ok(Command::Review(ReviewArgs {
                status: LotStatus::AcceptWithRemarks,
                ..
            }))
        ));
    }

    #[test]
    fn flags_override_environment_config() {
        let args = ModelArgs {
            model: Some("gemini-2.5-pro".to_string()),
            api_key: Some("flag-key".to_string()),
            max_retries: None,
            timeout: Some(5.0),
        };
        let config = resolve_config(Config::default().with_api_key("env-key"), &args);
        assert_eq!(config.api_key.as_deref(), Some("flag-key"));
        assert_eq!(config.model, "gemini-2.5-pro");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn append_keeps_previous_images_first_without_duplicates() {
        let merged = merged_image_paths(
            &["a.jpg".to_string(), "b.jpg".to_string()],
            &[PathBuf::from("b.jpg"), PathBuf::from("c.jpg")],
        );
        assert_eq!(
            merged,
            vec![
                PathBuf::from("a.jpg"),
                PathBuf::from("b.jpg"),
                PathBuf::from("c.jpg")
            ]
        );
    }

    #[test]
    fn review_updates_archive_and_writes_event() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let archive_path = temp.path().join("reports.json");
        let events_path = temp.path().join("events.jsonl");
        let key = ReportArchive::new(&archive_path).upsert(archived("PO-7", "Acme", "t1"))?;

        run_review(ReviewArgs {
            report: key.clone(),
            status: LotStatus::Reject,
            reviewer: "QA Lead".to_string(),
            store: StoreArgs {
                archive: archive_path.clone(),
                events: Some(events_path.clone()),
            },
        })?;

        let saved = ReportArchive::new(&archive_path)
            .get(&key)?
            .ok_or_else(|| anyhow!("report missing"))?;
        assert_eq!(saved.report.lot_assessment.lot_status, LotStatus::Reject);
        let event: Value = serde_json::from_str(fs::read_to_string(&events_path)?.trim())?;
        assert_eq!(event["type"], json!("lot_status_updated"));
        assert_eq!(event["previous_status"], json!("accept"));
        assert_eq!(event["lot_status"], json!("reject"));
        assert_eq!(event["report_key"], json!(key));
        assert_eq!(event["reviewer"], json!("QA Lead"));
        Ok(())
    }

    #[test]
    fn history_lines_filter_by_supplier() {
        let acme = archived("PO-1", "Acme", "2026-01-01T00:00:00Z");
        let other = archived("PO-2", "Other", "2026-01-02T00:00:00Z");
        assert!(matches_supplier(&acme, Some(" acme ")));
        assert!(!matches_supplier(&other, Some("acme")));
        assert!(matches_supplier(&other, None));

        let line = history_line(&acme);
        assert!(line.starts_with("PO-1@2026-01-01T00:00:00Z  Acme  R. Osei  0.00% defective  accept"));
    }

    #[test]
    fn extract_reads_model_output_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("response.txt");
        fs::write(&path, "```json\n{\"images\": []}\n```\nNothing to report.")?;
        assert_eq!(run_extract(ExtractArgs { input: path })?, 0);
        Ok(())
    }

    #[test]
    fn engine_errors_use_operator_wording() {
        let err = anyhow::Error::new(InspectError::from_status(429, "quota".to_string()));
        assert!(describe_error(&err).contains("usage limit reached"));
        let other = anyhow!("disk full").context("failed to save report");
        assert_eq!(describe_error(&other), "failed to save report: disk full");
    }
}
