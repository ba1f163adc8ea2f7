mod cli;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;

use cli::{Cli, Commands, SprintCommands};
use drover_core::assistant::CliAssistant;
use drover_core::config::RunConfig;
use drover_core::orchestrator::Orchestrator;
use drover_core::ports::AssistantRunner;
use drover_core::scanner::scan_issues;

const EXIT_INTERRUPTED: i32 = 130;

enum Mode {
    Parallel(Option<usize>),
    Auto,
    Sprint(String),
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("drover: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let (common, mode) = match cli.command {
        Commands::Parallel {
            common,
            max_workers,
        } => (common, Mode::Parallel(max_workers)),
        Commands::Auto { common } => (common, Mode::Auto),
        Commands::Sprint {
            command: SprintCommands::Run { name, common },
        } => (common, Mode::Sprint(name)),
    };

    let mut config = RunConfig::load(common.config.as_deref())?;
    common.apply(&mut config);
    match &mode {
        Mode::Parallel(max_workers) => {
            if let Some(n) = max_workers {
                config.max_workers = (*n).max(1);
            }
        }
        Mode::Auto => config.max_workers = 1,
        Mode::Sprint(name) => {
            let ids = config
                .sprints
                .get(name)
                .with_context(|| format!("sprint '{name}' is not declared in the config file"))?
                .clone();
            config.only_ids = ids.into_iter().collect();
        }
    }

    env_logger::Builder::from_env(
        Env::default().default_filter_or(if config.quiet { "warn" } else { "info" }),
    )
    .init();

    config.repo_root = std::env::current_dir()?
        .canonicalize()
        .context("resolving repository root")?;

    let mut issues = scan_issues(&config.repo_root, &config.issues_dir, &config.completed_dir)?;
    if let Some(priorities) = common.priorities() {
        issues.retain(|issue| priorities.contains(&issue.priority));
    }

    let assistant: Arc<dyn AssistantRunner> = Arc::new(CliAssistant::new(
        config.assistant_cmd.clone(),
        config.claude_timeout,
        config.idle_timeout,
        !config.quiet,
    ));
    let resume = common.resume;
    let orchestrator = Orchestrator::new(config, assistant);
    install_signal_handler(&orchestrator)?;

    let summary = orchestrator.run(issues, resume)?;
    println!("{}", summary.report_text);
    Ok(if summary.interrupted {
        EXIT_INTERRUPTED
    } else {
        0
    })
}

/// SIGINT/SIGTERM flip the shutdown flag; a second signal inside the grace
/// window exits immediately.
fn install_signal_handler(orchestrator: &Orchestrator) -> Result<()> {
    let flag = orchestrator.shutdown_flag();
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            std::process::exit(EXIT_INTERRUPTED);
        }
        eprintln!("drover: interrupt received, draining (press again to force quit)");
    })
    .context("installing signal handler")?;
    Ok(())
}
