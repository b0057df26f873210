//! CLI entry point for the sandbox isolation engine (sbx).

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};

use sandbox_isolation::cli::{parse_format, Cli, Command, RunArgs};
use sandbox_isolation::config::{load_config, load_default_config, EngineConfig};
use sandbox_isolation::filter::IptablesFilter;
use sandbox_isolation::manager::types::ExecOptions;
use sandbox_isolation::runtime::CliRuntime;
use sandbox_isolation::security::report;
use sandbox_isolation::store::PolicyStore;
use sandbox_isolation::utils::{init_debug_logging, is_debug_enabled};
use sandbox_isolation::SandboxEngine;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_debug_logging(cli.debug);

    let config = match cli.get_settings_path() {
        Some(path) if path.exists() => match load_config(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config from {:?}: {}", path, e);
                return ExitCode::from(1);
            }
        },
        _ => match load_default_config() {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading default config: {}", e);
                return ExitCode::from(1);
            }
        },
    };

    let result = match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Profiles => profiles(config).await,
        Command::Report { sandbox, format } => export_report(config, sandbox, &format).await,
        Command::Check => check(config).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            if is_debug_enabled() {
                eprintln!("Error: {:?}", e);
            } else {
                eprintln!("Error: {:#}", e);
            }
            ExitCode::from(1)
        }
    }
}

fn build_engine(config: EngineConfig) -> anyhow::Result<SandboxEngine> {
    let runtime = Arc::new(CliRuntime::new(config.runtime.binary.clone()));
    let filter = Arc::new(IptablesFilter::detect(config.network.filter_binary.clone()));
    SandboxEngine::new(config, runtime, filter).context("failed to build engine")
}

async fn run(config: EngineConfig, args: RunArgs) -> anyhow::Result<ExitCode> {
    let Some(command) = args.get_command()? else {
        bail!("no command specified. Use -c <command> or provide command as arguments.");
    };

    let engine = build_engine(config)?;
    if !engine.sandboxes().runtime().is_available().await {
        bail!(
            "container runtime '{}' is not available",
            engine.config().runtime.binary
        );
    }
    engine.initialize().await.context("failed to initialize engine")?;

    let options = ExecOptions {
        image: args.image.clone(),
        timeout: args.timeout(),
        cleanup_on_exit: Some(!args.keep),
        ..Default::default()
    };

    tracing::debug!(command = %sandbox_isolation::utils::join_args(&command), "running");

    let result = tokio::select! {
        result = engine.sandboxes().execute_in_sandbox(&args.task, command, options) => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, cleaning up");
            engine.shutdown().await;
            return Ok(ExitCode::from(130));
        }
    };

    if !args.keep {
        engine.shutdown().await;
    }

    let result = result.context("command failed")?;
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    if args.keep {
        eprintln!("sandbox kept: {}", result.sandbox_id);
    }
    tracing::debug!(sandbox = %result.sandbox_id, duration_ms = result.duration_ms, "finished");

    Ok(ExitCode::from(result.exit_code.clamp(0, 255) as u8))
}

async fn profiles(config: EngineConfig) -> anyhow::Result<ExitCode> {
    let engine = build_engine(config)?;
    engine
        .security()
        .load_persisted_profiles()
        .await
        .context("failed to load custom profiles")?;

    let profiles = engine.security().list_profiles();
    println!("{}", serde_json::to_string_pretty(&profiles)?);
    Ok(ExitCode::SUCCESS)
}

async fn export_report(
    config: EngineConfig,
    sandbox: Option<String>,
    format: &str,
) -> anyhow::Result<ExitCode> {
    let format = parse_format(format)?;
    let store = PolicyStore::new(config.security.policy_dir());
    let events = store
        .load_events(sandbox.as_deref())
        .await
        .with_context(|| format!("failed to read events from {}", store.root().display()))?;

    println!("{}", report::export(&events, sandbox.as_deref(), format)?);
    Ok(ExitCode::SUCCESS)
}

async fn check(config: EngineConfig) -> anyhow::Result<ExitCode> {
    let engine = build_engine(config)?;
    let availability = engine.tool_availability().await;
    println!("{}", serde_json::to_string_pretty(&availability)?);

    Ok(if availability.runtime_available {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}
