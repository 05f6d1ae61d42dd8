use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use plot_annotation_core::{
    annotator_baselines, columns, project, to_csv, to_ndjson, AnnotationRow, Confidence,
    PairJudgment, Rubric, Score, Session, SingleJudgment, Source, NORMALIZED_PREVIEW_COLUMNS,
};
use plot_annotation_store_sqlite::SqliteStore;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Parser)]
#[command(name = "pa")]
#[command(about = "Plot annotation CLI")]
struct Cli {
    #[arg(long, default_value = "./plot_annotations.sqlite3")]
    db: PathBuf,

    /// YAML rubric naming the scored dimensions and form defaults.
    #[arg(long)]
    rubric: Option<PathBuf>,

    /// Tracing filter directive; overrides `RUST_LOG`.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Annotator {
        #[command(subcommand)]
        command: Box<AnnotatorCommand>,
    },
    Plots {
        #[command(subcommand)]
        command: Box<PlotsCommand>,
    },
    Gold {
        #[command(subcommand)]
        command: Box<GoldCommand>,
    },
    Pair {
        #[command(subcommand)]
        command: Box<PairCommand>,
    },
    Single {
        #[command(subcommand)]
        command: Box<SingleCommand>,
    },
    Annotate {
        #[command(subcommand)]
        command: Box<AnnotateCommand>,
    },
    Annotations {
        #[command(subcommand)]
        command: Box<AnnotationsCommand>,
    },
    Export(ExportArgs),
    Stats,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate,
    Backup(DbBackupArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum AnnotatorCommand {
    Set(AnnotatorSetArgs),
    Show,
}

#[derive(Debug, Args)]
struct AnnotatorSetArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
enum PlotsCommand {
    /// Load JSON files holding one plot object or an array of plot objects.
    Load(PlotsLoadArgs),
    List,
    Show(IndexArgs),
    /// Drop every plot together with the gold set and selection.
    Clear,
}

#[derive(Debug, Args)]
struct PlotsLoadArgs {
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct IndexArgs {
    #[arg(long)]
    index: usize,
}

#[derive(Debug, Subcommand)]
enum GoldCommand {
    /// Replace the gold set. Passing no plots clears it.
    Set(GoldSetArgs),
    Show,
}

#[derive(Debug, Args)]
struct GoldSetArgs {
    #[arg(long = "plot-id", conflicts_with = "index")]
    plot_ids: Vec<String>,
    #[arg(long = "index")]
    index: Vec<usize>,
}

#[derive(Debug, Subcommand)]
enum PairCommand {
    Pick(PickArgs),
    Select(PairSelectArgs),
    Show,
}

#[derive(Debug, Args)]
struct PickArgs {
    /// Seed for a reproducible draw.
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Args)]
struct PairSelectArgs {
    #[arg(long)]
    a: usize,
    #[arg(long)]
    b: usize,
}

#[derive(Debug, Subcommand)]
enum SingleCommand {
    Pick(PickArgs),
    Select(IndexArgs),
    Show,
}

#[derive(Debug, Subcommand)]
enum AnnotateCommand {
    /// Score the selected pair side by side.
    Pair(AnnotatePairArgs),
    /// Score the selected single plot.
    Single(AnnotateSingleArgs),
}

#[derive(Debug, Args)]
struct AnnotatePairArgs {
    /// `DIMENSION=SCORE` for plot A; unlisted dimensions take the rubric default.
    #[arg(long = "score-a")]
    scores_a: Vec<String>,
    /// `DIMENSION=SCORE` for plot B; unlisted dimensions take the rubric default.
    #[arg(long = "score-b")]
    scores_b: Vec<String>,
    #[command(flatten)]
    form: FormArgs,
}

#[derive(Debug, Args)]
struct AnnotateSingleArgs {
    /// `DIMENSION=SCORE`; unlisted dimensions take the rubric default.
    #[arg(long = "score")]
    scores: Vec<String>,
    #[command(flatten)]
    form: FormArgs,
}

#[derive(Debug, Args)]
struct FormArgs {
    #[arg(long)]
    overall: Option<i64>,
    #[arg(long, value_enum)]
    confidence: Option<ConfidenceArg>,
    #[arg(long, default_value = "")]
    notes: String,
}

#[derive(Debug, Subcommand)]
enum AnnotationsCommand {
    List,
    /// Normalized rows projected onto the preview columns.
    Preview,
    Baselines,
    Clear,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long, value_enum, default_value_t = ExportFormat::Csv)]
    format: ExportFormat,
    /// Append the per-annotator `overall_z` column.
    #[arg(long, default_value_t = false)]
    normalized: bool,
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConfidenceArg {
    Low,
    Mid,
    High,
}

impl ConfidenceArg {
    fn into_confidence(self) -> Confidence {
        match self {
            Self::Low => Confidence::Low,
            Self::Mid => Confidence::Mid,
            Self::High => Confidence::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExportFormat {
    Csv,
    Ndjson,
}

impl ExportFormat {
    fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Ndjson => "ndjson",
        }
    }

    fn default_file_name(self, normalized: bool) -> String {
        let stem = if normalized {
            "plot_annotations_with_overall_z"
        } else {
            "plot_annotations_raw"
        };
        format!("{stem}.{}", self.as_str())
    }
}

/// Persisted session plus the rubric in effect for this invocation.
struct Workspace {
    store: SqliteStore,
    session: Session,
    rubric: Rubric,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(log_level: Option<&str>) -> Result<()> {
    let filter = match log_level {
        Some(directive) => EnvFilter::try_new(directive)
            .with_context(|| format!("invalid --log-level directive: {directive}"))?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;

    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
        Command::Annotator { command } => {
            run_annotator(*command, &mut open_workspace(&cli.db, cli.rubric.as_deref())?)
        }
        Command::Plots { command } => {
            run_plots(*command, &mut open_workspace(&cli.db, cli.rubric.as_deref())?)
        }
        Command::Gold { command } => {
            run_gold(*command, &mut open_workspace(&cli.db, cli.rubric.as_deref())?)
        }
        Command::Pair { command } => {
            run_pair(*command, &mut open_workspace(&cli.db, cli.rubric.as_deref())?)
        }
        Command::Single { command } => {
            run_single(*command, &mut open_workspace(&cli.db, cli.rubric.as_deref())?)
        }
        Command::Annotate { command } => {
            run_annotate(*command, &mut open_workspace(&cli.db, cli.rubric.as_deref())?)
        }
        Command::Annotations { command } => {
            run_annotations(*command, &mut open_workspace(&cli.db, cli.rubric.as_deref())?)
        }
        Command::Export(args) => {
            run_export(&args, &open_workspace(&cli.db, cli.rubric.as_deref())?)
        }
        Command::Stats => run_stats(&open_workspace(&cli.db, cli.rubric.as_deref())?),
    }
}

fn open_workspace(db: &Path, rubric: Option<&Path>) -> Result<Workspace> {
    let rubric = match rubric {
        Some(path) => Rubric::from_path(path)
            .with_context(|| format!("failed to load rubric {}", path.display()))?,
        None => Rubric::default(),
    };

    let mut store = SqliteStore::open(db)?;
    store.migrate()?;
    let session = store.load_session()?;
    tracing::debug!(
        db = %db.display(),
        plots = session.plots().len(),
        annotations = session.annotations().len(),
        "loaded session"
    );
    Ok(Workspace { store, session, rubric })
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate => {
            let before = store.schema_status()?;
            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "target_version": after.target_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )
        }
    }
}

fn run_annotator(command: AnnotatorCommand, ws: &mut Workspace) -> Result<()> {
    match command {
        AnnotatorCommand::Set(args) => {
            ws.session.set_annotator(&args.id);
            ws.store.set_annotator(ws.session.annotator_id())?;
            emit_json(serde_json::json!({ "annotator_id": ws.session.annotator_id() }))
        }
        AnnotatorCommand::Show => {
            let annotator_id = ws.session.annotator_id();
            emit_json(serde_json::json!({
                "annotator_id": annotator_id,
                "can_submit": !annotator_id.is_empty()
            }))
        }
    }
}

fn run_plots(command: PlotsCommand, ws: &mut Workspace) -> Result<()> {
    match command {
        PlotsCommand::Load(args) => {
            let (sources, unreadable) = read_sources(&args.files);

            let before = ws.session.plots().len();
            let mut report = ws.session.ingest(&sources);
            report.sources += unreadable.len();
            report.failed_sources.extend(unreadable);
            let stored = ws.store.append_plots(&ws.session.plots()[before..])?;
            tracing::info!(
                admitted = report.admitted,
                duplicates = report.duplicates,
                failed_sources = report.failed_sources.len(),
                "loaded plot sources"
            );
            emit_json(serde_json::json!({
                "report": report,
                "stored": stored,
                "plots_loaded": ws.session.plots().len()
            }))
        }
        PlotsCommand::List => emit_json(serde_json::json!({ "plots": ws.session.summaries() })),
        PlotsCommand::Show(args) => {
            let Some(plot) = ws.session.plots().get(args.index) else {
                return Err(anyhow!(
                    "plot index {} is out of range for {} loaded plots",
                    args.index,
                    ws.session.plots().len()
                ));
            };
            emit_json(serde_json::json!({
                "summary": plot.summary(args.index, ws.session.is_gold(&plot.plot_id())),
                "causal_graph": plot.causal_graph(),
                "record": plot
            }))
        }
        PlotsCommand::Clear => {
            ws.session.clear_plots();
            ws.store.clear_plots()?;
            emit_json(serde_json::json!({
                "plots_loaded": 0,
                "gold_plots": 0,
                "annotations_saved": ws.session.annotations().len()
            }))
        }
    }
}

/// Read every plot file. Files that cannot be read are logged and returned by label so
/// the readable ones still load.
fn read_sources(paths: &[PathBuf]) -> (Vec<Source>, Vec<String>) {
    let mut sources = Vec::with_capacity(paths.len());
    let mut unreadable = Vec::new();
    for path in paths {
        let label = path.display().to_string();
        match fs::read(path) {
            Ok(content) => sources.push(Source::new(label, content)),
            Err(err) => {
                tracing::warn!(source = %label, error = %err, "skipping unreadable source");
                unreadable.push(label);
            }
        }
    }
    (sources, unreadable)
}

fn run_gold(command: GoldCommand, ws: &mut Workspace) -> Result<()> {
    match command {
        GoldCommand::Set(args) => {
            if args.index.is_empty() {
                ws.session.set_gold(args.plot_ids)?;
            } else {
                ws.session.set_gold_by_index(args.index)?;
            }
            ws.store.replace_gold(ws.session.gold_ids())?;
            emit_gold(&ws.session)
        }
        GoldCommand::Show => emit_gold(&ws.session),
    }
}

fn emit_gold(session: &Session) -> Result<()> {
    let plots = session.summaries().into_iter().filter(|plot| plot.is_gold).collect::<Vec<_>>();
    emit_json(serde_json::json!({
        "gold_plot_ids": session.gold_ids(),
        "plots": plots
    }))
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn run_pair(command: PairCommand, ws: &mut Workspace) -> Result<()> {
    match command {
        PairCommand::Pick(args) => {
            let mut rng = seeded_rng(args.seed);
            if ws.session.random_pair(&mut rng).is_none() {
                return Err(anyhow!("no plots loaded; load plots before picking a pair"));
            }
            ws.store.save_selection(ws.session.pair(), ws.session.single())?;
            emit_pair(&ws.session)
        }
        PairCommand::Select(args) => {
            ws.session.select_pair(args.a, args.b)?;
            ws.store.save_selection(ws.session.pair(), ws.session.single())?;
            emit_pair(&ws.session)
        }
        PairCommand::Show => emit_pair(&ws.session),
    }
}

fn emit_pair(session: &Session) -> Result<()> {
    let pair = session.pair();
    let (plot_a, plot_b) = session.current_pair()?;
    emit_json(serde_json::json!({
        "a": plot_a.summary(pair.a, session.is_gold(&plot_a.plot_id())),
        "b": plot_b.summary(pair.b, session.is_gold(&plot_b.plot_id()))
    }))
}

fn run_single(command: SingleCommand, ws: &mut Workspace) -> Result<()> {
    match command {
        SingleCommand::Pick(args) => {
            let mut rng = seeded_rng(args.seed);
            if ws.session.random_single(&mut rng).is_none() {
                return Err(anyhow!("no plots loaded; load plots before picking a plot"));
            }
            ws.store.save_selection(ws.session.pair(), ws.session.single())?;
            emit_single(&ws.session)
        }
        SingleCommand::Select(args) => {
            ws.session.select_single(args.index)?;
            ws.store.save_selection(ws.session.pair(), ws.session.single())?;
            emit_single(&ws.session)
        }
        SingleCommand::Show => emit_single(&ws.session),
    }
}

fn emit_single(session: &Session) -> Result<()> {
    let plot = session.current_single()?;
    emit_json(serde_json::json!({
        "plot": plot.summary(session.single(), session.is_gold(&plot.plot_id()))
    }))
}

fn run_annotate(command: AnnotateCommand, ws: &mut Workspace) -> Result<()> {
    let now = OffsetDateTime::now_utc();
    let row = match command {
        AnnotateCommand::Pair(args) => {
            let judgment = PairJudgment {
                scores_a: ws.rubric.fill_scores(parse_score_overrides(&args.scores_a)?)?,
                scores_b: ws.rubric.fill_scores(parse_score_overrides(&args.scores_b)?)?,
                overall: overall_score(&args.form, &ws.rubric)?,
                confidence: confidence(&args.form, &ws.rubric),
                notes: args.form.notes,
            };
            ws.session.submit_pair(&judgment, &ws.rubric, now)?.clone()
        }
        AnnotateCommand::Single(args) => {
            let judgment = SingleJudgment {
                scores: ws.rubric.fill_scores(parse_score_overrides(&args.scores)?)?,
                overall: overall_score(&args.form, &ws.rubric)?,
                confidence: confidence(&args.form, &ws.rubric),
                notes: args.form.notes,
            };
            ws.session.submit_single(&judgment, &ws.rubric, now)?.clone()
        }
    };

    ws.store.append_annotation(&row)?;
    tracing::info!(
        annotator_id = ws.session.annotator_id(),
        is_calibration = row.is_calibration().unwrap_or(false),
        "saved annotation"
    );
    emit_json(serde_json::json!({
        "annotation": row,
        "annotations_saved": ws.session.annotations().len()
    }))
}

fn parse_score_overrides(raw: &[String]) -> Result<Vec<(String, Score)>> {
    raw.iter()
        .map(|entry| {
            let Some((key, value)) = entry.split_once('=') else {
                return Err(anyhow!("score must be DIMENSION=VALUE, got {entry}"));
            };
            let value = value
                .trim()
                .parse::<i64>()
                .with_context(|| format!("score for {key} is not an integer: {value}"))?;
            Ok((key.trim().to_string(), Score::new(value)?))
        })
        .collect()
}

fn overall_score(form: &FormArgs, rubric: &Rubric) -> Result<Score> {
    match form.overall {
        Some(value) => Ok(Score::new(value)?),
        None => Ok(rubric.default_score()),
    }
}

fn confidence(form: &FormArgs, rubric: &Rubric) -> Confidence {
    form.confidence.map_or(rubric.default_confidence, ConfidenceArg::into_confidence)
}

fn run_annotations(command: AnnotationsCommand, ws: &mut Workspace) -> Result<()> {
    match command {
        AnnotationsCommand::List => {
            emit_json(serde_json::json!({ "annotations": ws.session.annotations() }))
        }
        AnnotationsCommand::Preview => {
            let normalized = ws.session.normalized_annotations();
            let preview = project(&normalized, &NORMALIZED_PREVIEW_COLUMNS);
            emit_json(serde_json::json!({
                "columns": columns(&preview),
                "rows": preview
            }))
        }
        AnnotationsCommand::Baselines => emit_json(serde_json::json!({
            "baselines": annotator_baselines(ws.session.annotations())
        })),
        AnnotationsCommand::Clear => {
            let cleared = ws.session.annotations().len();
            ws.session.clear_annotations();
            ws.store.clear_annotations()?;
            emit_json(serde_json::json!({ "cleared": cleared, "annotations_saved": 0 }))
        }
    }
}

fn run_export(args: &ExportArgs, ws: &Workspace) -> Result<()> {
    if ws.session.annotations().is_empty() {
        return Err(anyhow!("no annotations to export"));
    }

    let rows: Vec<AnnotationRow> = if args.normalized {
        ws.session.normalized_annotations()
    } else {
        ws.session.annotations().to_vec()
    };
    let body = match args.format {
        ExportFormat::Csv => to_csv(&rows),
        ExportFormat::Ndjson => to_ndjson(&rows).context("failed to serialize annotations")?,
    };

    let out = args
        .out
        .clone()
        .unwrap_or_else(|| PathBuf::from(args.format.default_file_name(args.normalized)));
    if let Some(parent) = out.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create parent directory for export {}", out.display())
        })?;
    }
    fs::write(&out, body.as_bytes())
        .with_context(|| format!("failed to write export {}", out.display()))?;

    emit_json(serde_json::json!({
        "out": out,
        "format": args.format.as_str(),
        "normalized": args.normalized,
        "rows": rows.len(),
        "columns": columns(&rows),
        "sha256": format!("{:x}", Sha256::digest(body.as_bytes()))
    }))
}

fn run_stats(ws: &Workspace) -> Result<()> {
    let status = ws.store.schema_status()?;
    let mut stats =
        serde_json::to_value(ws.session.stats()).context("failed to serialize session stats")?;
    if let Value::Object(object) = &mut stats {
        object.insert(
            "dimensions".to_string(),
            serde_json::json!(ws.rubric.dimension_keys()),
        );
        object.insert("schema_version".to_string(), serde_json::json!(status.current_version));
    }
    emit_json(stats)
}
