//! CLI command definitions for ruleforge.
//!
//! Rule generation and checking against JSON datasets, local pipeline runs
//! through an in-memory (or PostgreSQL) ledger, and metrics export.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::dataset::{Dataset, DatasetId, JsonFileDatasetLoader};
use crate::ledger::{LedgerStore, Metadata};
use crate::llm::{LiteLlmClient, LlmTextGenerator, TextGenerator};
use crate::metrics;
use crate::pipeline::{build_correction_loop, build_service, Collaborators, ForgeConfig, StepKind};
use crate::rules::{validate_condition, BusinessRule, RuleExecutor, RuleStore, Severity};
use crate::storage::Database;

/// Dataset id used for files given on the command line.
const DEFAULT_DATASET_ID: DatasetId = 1;

/// Business-rule generation and dataset pipeline runner.
#[derive(Parser)]
#[command(name = "ruleforge")]
#[command(about = "Generate, test and apply business rules over tabular datasets")]
#[command(version)]
#[command(
    long_about = "ruleforge proposes data-quality rules for a dataset, tests them against a sample, repairs the ones that fail, and runs dataset pipelines with a persistent step ledger.\n\nExample usage:\n  ruleforge rules generate --dataset ./orders.json --engine statistical\n  ruleforge pipeline run --dataset ./orders.json --skip generate_embeddings"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Generate or check business rules.
    Rules(RulesArgs),

    /// Run dataset pipelines.
    Pipeline(PipelineArgs),

    /// Print the Prometheus metrics exposition.
    Metrics,
}

#[derive(Parser, Debug)]
pub struct RulesArgs {
    #[command(subcommand)]
    pub command: RulesSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum RulesSubcommand {
    /// Generate rules with one backend and run the self-correction loop.
    #[command(alias = "gen")]
    Generate(RulesGenerateArgs),

    /// Execute a single condition against a dataset.
    Check(RulesCheckArgs),
}

/// Arguments for `ruleforge rules generate`.
#[derive(Parser, Debug)]
pub struct RulesGenerateArgs {
    /// JSON file holding an array of records.
    #[arg(short, long)]
    pub dataset: PathBuf,

    /// Dataset id stamped on generated rules.
    #[arg(long, default_value_t = DEFAULT_DATASET_ID)]
    pub dataset_id: DatasetId,

    /// Generator backend (ai, statistical, schema, classifier). Defaults to the configured engine.
    #[arg(short, long)]
    pub engine: Option<String>,

    /// Rows used to test drafts.
    #[arg(long)]
    pub sample_size: Option<usize>,

    /// Model for generation and repair calls.
    #[arg(short, long, env = "RULEFORGE_MODEL")]
    pub model: Option<String>,

    /// Never call the text-generation service, even when LITELLM_API_BASE is set.
    #[arg(long)]
    pub offline: bool,
}

/// Arguments for `ruleforge rules check`.
#[derive(Parser, Debug)]
pub struct RulesCheckArgs {
    /// JSON file holding an array of records.
    #[arg(short, long)]
    pub dataset: PathBuf,

    /// Condition that every row must satisfy, e.g. "amount >= 0".
    #[arg(short, long)]
    pub condition: String,

    /// Severity reported for violations (low, medium, high).
    #[arg(short, long, default_value = "medium")]
    pub severity: String,
}

#[derive(Parser, Debug)]
pub struct PipelineArgs {
    #[command(subcommand)]
    pub command: PipelineSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum PipelineSubcommand {
    /// Create a run and execute its steps in order.
    Run(PipelineRunArgs),
}

/// Arguments for `ruleforge pipeline run`.
#[derive(Parser, Debug)]
pub struct PipelineRunArgs {
    /// JSON file holding an array of records.
    #[arg(short, long)]
    pub dataset: PathBuf,

    #[arg(long, default_value_t = DEFAULT_DATASET_ID)]
    pub dataset_id: DatasetId,

    /// Step kinds to skip (repeatable), e.g. --skip enrich --skip profile.
    #[arg(long = "skip")]
    pub skip: Vec<String>,

    /// Owner recorded on the run.
    #[arg(long)]
    pub owner: Option<String>,

    /// Add a business_rules step to the run.
    #[arg(long)]
    pub business_rules: bool,

    /// Never call the text-generation service.
    #[arg(long)]
    pub offline: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    let cli = parse_cli();
    run_with_cli(cli).await
}

/// Run the CLI with pre-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    metrics::init_metrics()?;
    match cli.command {
        Commands::Rules(args) => match args.command {
            RulesSubcommand::Generate(args) => run_rules_generate_command(args).await,
            RulesSubcommand::Check(args) => run_rules_check_command(args).await,
        },
        Commands::Pipeline(args) => match args.command {
            PipelineSubcommand::Run(args) => run_pipeline_command(args).await,
        },
        Commands::Metrics => {
            print!("{}", metrics::export_metrics());
            Ok(())
        }
    }
}

/// Text generator from `LITELLM_*` variables, or `None` when unconfigured.
fn build_text_generator(config: &ForgeConfig, offline: bool) -> Option<Arc<dyn TextGenerator>> {
    if offline {
        return None;
    }
    match LiteLlmClient::from_env() {
        Ok(client) => {
            let model = config
                .model
                .clone()
                .unwrap_or_else(|| client.default_model().to_string());
            info!(api_base = %client.api_base(), model = %model, "Using LiteLLM text generation");
            let generator: Arc<dyn TextGenerator> = Arc::new(
                LlmTextGenerator::new(Arc::new(client), model)
                    .with_timeout(config.llm_timeout)
                    .with_retry(config.retry_config()),
            );
            Some(generator)
        }
        Err(e) => {
            warn!(error = %e, "Text generation unavailable; AI backends disabled");
            None
        }
    }
}

async fn load_dataset(path: &Path, id: DatasetId) -> anyhow::Result<Dataset> {
    let path = path.to_path_buf();
    let dataset = tokio::task::spawn_blocking(move || Dataset::load_json_file(id, &path)).await??;
    Ok(dataset)
}

async fn run_rules_generate_command(args: RulesGenerateArgs) -> anyhow::Result<()> {
    let mut config = ForgeConfig::from_env()?;
    if let Some(model) = args.model.clone() {
        config = config.with_model(model);
    }
    if let Some(size) = args.sample_size {
        config = config.with_sample_size(size);
    }
    config.validate()?;

    let dataset = Arc::new(load_dataset(&args.dataset, args.dataset_id).await?);
    let llm = build_text_generator(&config, args.offline);
    let correction = build_correction_loop(&config, llm)?;

    let engine = args.engine.unwrap_or_else(|| config.default_engine.clone());
    let batch = correction.run(dataset, &engine).await;
    info!(
        engine = %batch.engine_used,
        accepted = batch.rules.len(),
        corrected = batch.corrected_rules_count,
        discarded = batch.discarded_count(),
        "Rule generation finished"
    );
    println!("{}", serde_json::to_string_pretty(&batch)?);
    Ok(())
}

async fn run_rules_check_command(args: RulesCheckArgs) -> anyhow::Result<()> {
    let dataset = load_dataset(&args.dataset, DEFAULT_DATASET_ID).await?;
    validate_condition(&args.condition, Some(&dataset))?;
    let severity = Severity::from_str(&args.severity).map_err(anyhow::Error::msg)?;

    let rule = BusinessRule::new(dataset.id(), "cli check", args.condition.clone()).with_severity(severity);
    let result = RuleExecutor::default().execute(&rule, &dataset);

    let output = json!({
        "condition": rule.condition,
        "severity": rule.severity,
        "blocking": !result.success && rule.severity.is_blocking(),
        "result": result,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Validates `--skip` names and turns them into step params.
fn skip_params(skip: &[String]) -> anyhow::Result<Metadata> {
    let kinds = skip
        .iter()
        .map(|name| name.parse::<StepKind>())
        .collect::<Result<Vec<_>, _>>()?;
    let mut params = Metadata::new();
    if !kinds.is_empty() {
        params.insert("skip_steps".to_string(), json!(kinds));
    }
    Ok(params)
}

async fn run_pipeline_command(args: PipelineRunArgs) -> anyhow::Result<()> {
    let config = ForgeConfig::from_env()?.with_business_rules_step(args.business_rules);
    let params = skip_params(&args.skip)?;

    let loader = Arc::new(JsonFileDatasetLoader::new());
    loader.register(args.dataset_id, args.dataset.clone()).await;

    let mut collaborators = Collaborators::in_memory(loader);
    if let Some(url) = &config.database_url {
        let db = Database::connect(url).await?;
        db.run_migrations().await?;
        let ledger_store: Arc<dyn LedgerStore> = Arc::new(db.ledger_store());
        let rule_store: Arc<dyn RuleStore> = Arc::new(db.rule_store());
        collaborators.ledger_store = ledger_store;
        collaborators.rule_store = rule_store;
        info!("Using PostgreSQL ledger");
    }
    if let Some(llm) = build_text_generator(&config, args.offline) {
        collaborators = collaborators.with_llm(llm);
    }

    let service = build_service(&config, collaborators)?;
    let owner = args.owner.as_deref();
    let run_id = service.trigger_run(args.dataset_id, owner).await?;
    info!(run_id = %run_id, dataset_id = args.dataset_id, "Run created");

    let report = service.get_status(run_id, owner).await?;
    for step in report.steps {
        let submission = service.run_step(step.id, params.clone(), owner).await?;
        if let Err(e) = submission.handle.wait().await {
            warn!(step = %step.step_type, error = %e, "Step failed; stopping run");
            break;
        }
    }

    let report = service.get_status(run_id, owner).await?;
    service.shutdown().await?;
    let output: JsonValue = serde_json::to_value(&report)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_pipeline_run_with_skips() {
        let cli = Cli::try_parse_from([
            "ruleforge",
            "pipeline",
            "run",
            "--dataset",
            "orders.json",
            "--skip",
            "enrich",
            "--skip",
            "detect-anomalies",
        ])
        .unwrap();
        let Commands::Pipeline(PipelineArgs {
            command: PipelineSubcommand::Run(args),
        }) = cli.command
        else {
            panic!("expected pipeline run");
        };
        assert_eq!(args.skip, vec!["enrich", "detect-anomalies"]);
        assert_eq!(args.dataset_id, DEFAULT_DATASET_ID);

        let params = skip_params(&args.skip).unwrap();
        assert_eq!(params["skip_steps"], json!(["enrich", "detect_anomalies"]));
    }

    #[test]
    fn test_skip_params_rejects_unknown_kind() {
        assert!(skip_params(&["publish".to_string()]).is_err());
        assert!(skip_params(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_rules_check() {
        let cli = Cli::try_parse_from([
            "ruleforge",
            "rules",
            "check",
            "-d",
            "orders.json",
            "-c",
            "amount >= 0",
        ])
        .unwrap();
        match cli.command {
            Commands::Rules(RulesArgs {
                command: RulesSubcommand::Check(args),
            }) => {
                assert_eq!(args.condition, "amount >= 0");
                assert_eq!(args.severity, "medium");
            }
            _ => panic!("expected rules check"),
        }
    }
}
