#![forbid(unsafe_code)]

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use qualcode_harness::batch::{run_batch, BatchRequest, BatchResult};
use qualcode_harness::cache::SqliteCodingCache;
use qualcode_harness::coding::{estimate_item_input_tokens, CodingOptions, RunContext};
use qualcode_harness::config::HarnessConfig;
use qualcode_harness::export::{write_export, StatTable};
use qualcode_harness::extract::extract_with_codebook;
use qualcode_harness::gateway::{
    chat_cost, nanos_to_usd, ProviderGateway, TallyUsageSink, TracingUsageSink,
};
use qualcode_harness::items::{parse_pasted_rows, sample_items, PastedRow};
use qualcode_harness::reliability::{
    render_report_markdown, run_reliability, score_collected, CollectedRow, ReliabilityItem,
    ReliabilityReport, ReliabilityRequest,
};
use qualcode_harness::session::CodingSession;
use qualcode_harness::trace::{JsonlTraceSink, TraceSink};

#[derive(Parser)]
#[command(name = "qualcode", version, about = "LLM-assisted qualitative coding harness")]
struct Cli {
    /// JSON config file (overlaid by QUALCODE_* env vars)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the codebook
    Categories,
    /// Extract a category code from model output (argument or stdin)
    Extract {
        text: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Score model outputs already collected alongside human codes
    Score {
        /// JSON array of {item, human_1, human_2?, model_output}
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Draw a seeded random test set from a dataset
    Sample {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        n: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long)]
        out: PathBuf,
    },
    /// One protocol drafting round with the model
    Refine {
        #[arg(long)]
        session: PathBuf,
        #[arg(long)]
        instruction: String,
        #[arg(long)]
        model: Option<String>,
    },
    /// Code a human-coded test set and score agreement
    Reliability {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        session: Option<PathBuf>,
        #[arg(long)]
        report: Option<PathBuf>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Apply the protocol to a full dataset
    Batch {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        session: Option<PathBuf>,
        /// Estimate tokens and cost without calling the model
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Write CSV + SPSS syntax from a batch or reliability result
    Export {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, value_enum, default_value_t = ExportKind::Batch)]
        kind: ExportKind,
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value = "coded")]
        stem: String,
    },
    /// Export SQLite cache to JSONL
    CacheExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune SQLite cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    cache: Option<PathBuf>,
    #[arg(long)]
    no_cache: bool,
    #[arg(long)]
    lock_cache: bool,
    #[arg(long)]
    cache_only: bool,
    #[arg(long)]
    trace: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportKind {
    Batch,
    Reliability,
}

#[derive(Serialize)]
struct DryRunEstimate {
    items: usize,
    model: String,
    input_tokens: u64,
    max_output_tokens: u64,
    max_cost_usd: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = HarnessConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Categories => {
            let codebook = config.codebook()?;
            for entry in &codebook.entries {
                println!("{}\t{}\t{}", entry.category, entry.label, entry.group.label());
            }
            println!("0.0\t{}", codebook.uncodable_label);
        }
        Commands::Extract { text, json } => {
            let raw = match text {
                Some(text) => text,
                None => {
                    let mut buf = String::new();
                    io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let extraction = extract_with_codebook(&raw, &config.codebook()?);
            if json {
                println!("{}", serde_json::to_string(&extraction)?);
            } else {
                println!("{}", extraction.category);
            }
        }
        Commands::Score { input, out, report } => {
            let codebook = config.codebook()?;
            let rows: Vec<CollectedRow> = read_json(&input)?;
            let scored = score_collected(&rows, &codebook)?;
            print_summary(&scored);
            if let Some(out) = out {
                write_json(&out, &scored)?;
            }
            if let Some(path) = report {
                std::fs::write(path, render_report_markdown(&scored, &codebook))?;
            }
        }
        Commands::Sample {
            input,
            n,
            seed,
            out,
        } => {
            let rows = read_rows(&input)?;
            let sampled = sample_items(&rows, n, seed)?;
            write_json(&out, &sampled)?;
            eprintln!("sampled {} of {} rows", sampled.len(), rows.len());
        }
        Commands::Refine {
            session,
            instruction,
            model,
        } => {
            let mut state = open_session(&session, &config)?;
            let model = model.unwrap_or_else(|| config.coding.model.clone());
            let gateway = ProviderGateway::from_env(Arc::new(TracingUsageSink))?;
            let revision = state.refine_protocol(&gateway, &model, &instruction).await?;
            println!("{}", revision.text);
            eprintln!("protocol version {}", revision.version);
            state.save(&session)?;
        }
        Commands::Reliability {
            input,
            out,
            session,
            report,
            run,
        } => {
            let mut state = match &session {
                Some(path) => open_session(path, &config)?,
                None => CodingSession::new(config.codebook()?),
            };
            let items = read_rows(&input)?
                .into_iter()
                .enumerate()
                .map(|(idx, row)| {
                    let human_1 = row
                        .human_1
                        .ok_or_else(|| format!("row {} has no human code", idx + 1))?;
                    let item = ReliabilityItem::new(row.item, human_1);
                    Ok(match row.human_2 {
                        Some(h2) => item.with_second_coder(h2),
                        None => item,
                    })
                })
                .collect::<Result<Vec<_>, String>>()?;

            let mut request = ReliabilityRequest::new(items);
            request.options = run_options(&config, &run);
            request.concurrency = run.concurrency.unwrap_or(config.concurrency);

            let runner = Runner::open(&config, &run)?;
            let ctx = runner.context(&state);
            let result = run_reliability(&ctx, &request).await?;
            runner.finish()?;

            print_summary(&result);
            write_json(&out, &result)?;
            if let Some(path) = report {
                std::fs::write(path, render_report_markdown(&result, &state.codebook))?;
            }
            if let Some(path) = session {
                state.record_reliability(result);
                state.save(path)?;
            }
        }
        Commands::Batch {
            input,
            out,
            session,
            dry_run,
            run,
        } => {
            let mut state = match &session {
                Some(path) => open_session(path, &config)?,
                None => CodingSession::new(config.codebook()?),
            };
            let items = read_rows(&input)?
                .into_iter()
                .map(|row| row.item)
                .collect::<Vec<_>>();
            let options = run_options(&config, &run);

            if dry_run {
                let input_tokens: u64 = items
                    .iter()
                    .map(|item| {
                        estimate_item_input_tokens(
                            &options,
                            &state.protocol().text,
                            &state.codebook,
                            item,
                        ) as u64
                    })
                    .sum();
                let max_output_tokens = options.max_tokens() as u64 * items.len() as u64;
                let cost = chat_cost(
                    &options.model,
                    u32::try_from(input_tokens).unwrap_or(u32::MAX),
                    u32::try_from(max_output_tokens).unwrap_or(u32::MAX),
                );
                let estimate = DryRunEstimate {
                    items: items.len(),
                    model: options.model.clone(),
                    input_tokens,
                    max_output_tokens,
                    max_cost_usd: nanos_to_usd(cost),
                };
                println!("{}", serde_json::to_string_pretty(&estimate)?);
                return Ok(());
            }

            let Some(out) = out else {
                return Err("batch requires --out unless --dry-run is given".into());
            };
            let mut request = BatchRequest::new(items);
            request.options = options;
            request.concurrency = run.concurrency.unwrap_or(config.concurrency);

            let runner = Runner::open(&config, &run)?;
            let ctx = runner.context(&state);
            let result = run_batch(&ctx, &request).await?;
            runner.finish()?;

            for count in &result.distribution {
                println!("{}\t{}\t{}", count.category, count.count, count.label);
            }
            write_json(&out, &result)?;
            if let Some(path) = session {
                state.record_batch(result);
                state.save(path)?;
            }
        }
        Commands::Export {
            input,
            kind,
            dir,
            stem,
        } => {
            let codebook = config.codebook()?;
            let table = match kind {
                ExportKind::Batch => {
                    let result: BatchResult = read_json(&input)?;
                    StatTable::from_batch(&result, &codebook)
                }
                ExportKind::Reliability => {
                    let report: ReliabilityReport = read_json(&input)?;
                    StatTable::from_reliability(&report, &codebook)
                }
            };
            let paths = write_export(&table, &dir, &stem)?;
            println!("{}", paths.csv.display());
            println!("{}", paths.syntax.display());
        }
        Commands::CacheExport { db, out } => {
            let path = db.unwrap_or_else(|| config.cache_path());
            let cache = SqliteCodingCache::new(path)?;
            let written = cache.export_jsonl(out).await?;
            eprintln!("exported {written} rows");
        }
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-days and/or --max-rows".into());
            }
            if matches!(max_rows, Some(0)) {
                return Err("--max-rows must be >= 1".into());
            }
            let path = db.unwrap_or_else(|| config.cache_path());
            let cache = SqliteCodingCache::new(path)?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            println!(
                "pruned {} rows; {} rows remain",
                stats.deleted, stats.remaining
            );
        }
    }

    Ok(())
}

/// Gateway, cache and trace sink for one live run.
struct Runner {
    gateway: ProviderGateway<TallyUsageSink<TracingUsageSink>>,
    cache: Option<SqliteCodingCache>,
    _lock: Option<qualcode_harness::cache::CacheLock>,
    trace: Option<(JsonlTraceSink, qualcode_harness::trace::TraceWorker)>,
}

impl Runner {
    fn open(config: &HarnessConfig, run: &RunArgs) -> Result<Self, Box<dyn std::error::Error>> {
        let gateway =
            ProviderGateway::from_env(Arc::new(TallyUsageSink::new(TracingUsageSink)))?;
        let cache = if run.no_cache {
            None
        } else {
            let path = run.cache.clone().unwrap_or_else(|| config.cache_path());
            Some(SqliteCodingCache::new(path)?)
        };
        let _lock = match (&cache, run.lock_cache) {
            (Some(cache), true) => Some(cache.lock_exclusive()?),
            _ => None,
        };
        let trace = match &run.trace {
            Some(path) => Some(JsonlTraceSink::new(path)?),
            None => None,
        };
        Ok(Self {
            gateway,
            cache,
            _lock,
            trace,
        })
    }

    fn context<'a>(&'a self, session: &'a CodingSession) -> RunContext<'a> {
        let mut ctx = RunContext::new(&self.gateway, &session.codebook, session.protocol())
            .with_session(session.id);
        if let Some(cache) = &self.cache {
            ctx = ctx.with_cache(cache);
        }
        if let Some((sink, _)) = &self.trace {
            ctx = ctx.with_trace(sink as &dyn TraceSink);
        }
        ctx
    }

    fn finish(self) -> Result<(), Box<dyn std::error::Error>> {
        let totals = self.gateway.usage_sink().totals();
        eprintln!(
            "{} calls ({} failed), {} in / {} out tokens, ${:.4}",
            totals.calls,
            totals.failed_calls,
            totals.input_tokens,
            totals.output_tokens,
            nanos_to_usd(totals.cost_nanodollars)
        );
        if let Some((sink, worker)) = self.trace {
            drop(sink);
            let written = worker.join()?;
            eprintln!("wrote {written} trace records");
        }
        Ok(())
    }
}

fn run_options(config: &HarnessConfig, run: &RunArgs) -> CodingOptions {
    let mut options = config.coding.clone();
    if let Some(model) = &run.model {
        options.model = model.clone();
    }
    options.cache_only |= run.cache_only;
    options
}

fn open_session(
    path: &Path,
    config: &HarnessConfig,
) -> Result<CodingSession, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(CodingSession::load(path)?)
    } else {
        Ok(CodingSession::new(config.codebook()?))
    }
}

fn print_summary(report: &ReliabilityReport) {
    println!(
        "{} = {:.3} over {} items ({} raters)",
        report.agreement.method.label(),
        report.agreement.kappa,
        report.agreement.n_items,
        report.agreement.n_raters
    );
    println!("{}", report.recommendation.message());
    let degraded = report.diagnostics.degraded_items();
    if degraded > 0 {
        eprintln!("warning: {degraded} items were not cleanly coded; see diagnostics");
    }
}

/// `.json` files hold an array of rows; anything else is tab-separated text.
fn read_rows(path: &Path) -> Result<Vec<PastedRow>, Box<dyn std::error::Error>> {
    if path.extension().is_some_and(|ext| ext == "json") {
        read_json(path)
    } else {
        let raw = std::fs::read_to_string(path)?;
        Ok(parse_pasted_rows(&raw)?)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}
