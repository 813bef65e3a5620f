use std::{fs, path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result, bail};
use chainfury_engine::{
    ActionRegistry, ChainExecutor, EngineConfig, RunOptions, builtin, config::default_config_path, parse_chain_file,
    run_response,
};
use chainfury_types::{FailurePolicy, RunStatus};
use chainfury_util::run_store::{JsonRunStore, RunStore};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let matches = build_cli().get_matches();

    match matches.subcommand() {
        Some(("run", sub)) => run_chain_cmd(sub).await,
        Some(("plan", sub)) => plan_cmd(sub).map(|_| ExitCode::SUCCESS),
        Some(("validate", sub)) => validate_cmd(sub).map(|_| ExitCode::SUCCESS),
        Some(("actions", sub)) => actions_cmd(sub).map(|_| ExitCode::SUCCESS),
        Some(("history", sub)) => history_cmd(sub).map(|_| ExitCode::SUCCESS),
        _ => {
            build_cli().print_help()?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env("CHAINFURY_LOG"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_cli() -> Command {
    let chain_arg = || {
        Arg::new("chain")
            .required(true)
            .value_parser(value_parser!(PathBuf))
            .help("Path to a chain definition (YAML or JSON)")
    };

    Command::new("chainfury")
        .about("Validate and execute ChainFury chains")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Engine config file; defaults to CHAINFURY_CONFIG_PATH or the user config directory"),
        )
        .subcommand(
            Command::new("run")
                .about("Execute a chain and print the run response as JSON")
                .arg(chain_arg())
                .arg(
                    Arg::new("inputs")
                        .long("inputs")
                        .short('i')
                        .action(ArgAction::Set)
                        .conflicts_with("inputs-file")
                        .help("Chain inputs as a JSON object"),
                )
                .arg(
                    Arg::new("inputs-file")
                        .long("inputs-file")
                        .value_parser(value_parser!(PathBuf))
                        .help("File containing chain inputs as a JSON object"),
                )
                .arg(
                    Arg::new("policy")
                        .long("policy")
                        .value_parser(["abort", "continue"])
                        .help("Override the chain's failure policy"),
                )
                .arg(Arg::new("run-id").long("run-id").action(ArgAction::Set).help("Caller-chosen run id"))
                .arg(
                    Arg::new("no-persist")
                        .long("no-persist")
                        .action(ArgAction::SetTrue)
                        .help("Do not store the run even when persist_runs is enabled"),
                ),
        )
        .subcommand(
            Command::new("plan")
                .about("Print the execution layers of a chain")
                .arg(chain_arg()),
        )
        .subcommand(
            Command::new("validate")
                .about("Check a chain against the built-in action catalogue")
                .arg(chain_arg()),
        )
        .subcommand(Command::new("actions").about("List registered action types and their schemas"))
        .subcommand(
            Command::new("history")
                .about("Show stored runs")
                .arg(Arg::new("chain-id").long("chain").action(ArgAction::Set).help("Only runs of this chain"))
                .arg(Arg::new("run-id").long("run").action(ArgAction::Set).help("Print one stored run in full"))
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_parser(value_parser!(usize))
                        .default_value("20"),
                ),
        )
}

fn load_config(matches: &ArgMatches) -> Result<EngineConfig> {
    let path = matches.get_one::<PathBuf>("config").cloned().unwrap_or_else(default_config_path);
    EngineConfig::load_from_path(&path).with_context(|| format!("Failed to load engine config {}", path.display()))
}

fn builtin_registry() -> Result<ActionRegistry> {
    let mut registry = ActionRegistry::new();
    builtin::register_builtin_actions(&mut registry)?;
    Ok(registry)
}

fn build_executor(matches: &ArgMatches) -> Result<ChainExecutor> {
    Ok(ChainExecutor::new(Arc::new(builtin_registry()?), load_config(matches)?))
}

fn read_inputs(matches: &ArgMatches) -> Result<JsonMap<String, JsonValue>> {
    let raw = if let Some(inline) = matches.get_one::<String>("inputs") {
        inline.clone()
    } else if let Some(path) = matches.get_one::<PathBuf>("inputs-file") {
        fs::read_to_string(path).with_context(|| format!("Failed to read inputs file: {}", path.display()))?
    } else {
        return Ok(JsonMap::new());
    };

    match serde_json::from_str::<JsonValue>(&raw).context("Chain inputs must be valid JSON")? {
        JsonValue::Object(inputs) => Ok(inputs),
        other => bail!("chain inputs must be a JSON object, got {other}"),
    }
}

async fn run_chain_cmd(matches: &ArgMatches) -> Result<ExitCode> {
    let chain_path = matches.get_one::<PathBuf>("chain").context("missing chain path")?;
    let chain = parse_chain_file(chain_path)?;
    let inputs = read_inputs(matches)?;
    let executor = build_executor(matches)?;

    let failure_policy = matches
        .get_one::<String>("policy")
        .map(|policy| policy.parse::<FailurePolicy>())
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let cancellation = CancellationToken::new();
    let options = RunOptions {
        failure_policy,
        cancellation: cancellation.clone(),
        run_id: matches.get_one::<String>("run-id").cloned(),
    };

    let interrupt = cancellation.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling run");
            interrupt.cancel();
        }
    });
    let result = executor.run(&chain, inputs, options).await;
    signal_task.abort();

    let response = run_response(result);
    info!(run_id = %response.run_id, chain_id = %response.chain_id, status = ?response.status, "run finished");

    let config = executor.config();
    if config.persist_runs && !matches.get_flag("no-persist") {
        let store = JsonRunStore::new(config.run_store_path(), config.run_history_limit)?;
        if let Err(error) = store.save(&response) {
            warn!(path = %store.path().display(), %error, "failed to persist run");
        }
    }

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(match response.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Aborted => ExitCode::FAILURE,
    })
}

fn plan_cmd(matches: &ArgMatches) -> Result<()> {
    let chain_path = matches.get_one::<PathBuf>("chain").context("missing chain path")?;
    let chain = parse_chain_file(chain_path)?;
    let executor = build_executor(matches)?;
    let plan = executor.plan(&chain)?;

    let layers: Vec<JsonValue> = plan
        .layers()
        .iter()
        .enumerate()
        .map(|(index, nodes)| json!({ "layer": index, "nodes": nodes }))
        .collect();
    let out = json!({
        "chainId": chain.id,
        "order": plan.order(),
        "layers": layers,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn validate_cmd(matches: &ArgMatches) -> Result<()> {
    let chain_path = matches.get_one::<PathBuf>("chain").context("missing chain path")?;
    let chain = parse_chain_file(chain_path)?;
    let executor = build_executor(matches)?;
    let plan = executor.plan(&chain)?;
    println!(
        "chain '{}' is valid: {} nodes in {} layers",
        chain.id,
        plan.len(),
        plan.layers().len()
    );
    Ok(())
}

fn actions_cmd(_matches: &ArgMatches) -> Result<()> {
    let registry = builtin_registry()?;
    println!("{}", serde_json::to_string_pretty(&registry.describe())?);
    Ok(())
}

fn history_cmd(matches: &ArgMatches) -> Result<()> {
    let config = load_config(matches)?;
    let store = JsonRunStore::new(config.run_store_path(), config.run_history_limit)?;

    if let Some(run_id) = matches.get_one::<String>("run-id") {
        let stored = store.get(run_id)?.with_context(|| format!("no stored run with id '{run_id}'"))?;
        println!("{}", serde_json::to_string_pretty(&stored)?);
        return Ok(());
    }

    let limit = matches.get_one::<usize>("limit").copied().unwrap_or(20);
    let chain_id = matches.get_one::<String>("chain-id").map(String::as_str);
    let runs = store.list(chain_id)?;
    if runs.is_empty() {
        println!("No stored runs in {}", store.path().display());
        return Ok(());
    }
    for run in runs.into_iter().take(limit) {
        let status = match run.status {
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
        };
        println!("{}  {}  {:<9}  {}", run.stored_at.to_rfc3339(), run.run_id, status, run.chain_id);
    }
    Ok(())
}
