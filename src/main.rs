use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use clickflow::config::{self as cfg, Settings};
use clickflow::executor::{EventSink, RunEvent, SequenceRunner, spawn_run};
use clickflow::graph::{CompileOptions, FlowGraph, compile_with};
use clickflow::model::CompiledSequence;
use clickflow::project;

/// Clickflow CLI
#[derive(Debug, Parser)]
#[command(
    name = clickflow::PKG_NAME,
    version = clickflow::PKG_VERSION,
    about = "Image-matching click automation: wait for a reference image, then click it"
)]
struct Args {
    /// Path to the JSON settings file (defaults apply when omitted)
    #[arg(short = 's', long = "settings", global = true)]
    settings: Option<PathBuf>,

    /// Set log level (e.g., trace, debug, info, warn, error). Overrides RUST_LOG.
    #[arg(long = "log-level", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a project's steps (compiling its graph when it has none)
    Run {
        /// Path to the project file
        #[arg(short = 'p', long = "project")]
        project: PathBuf,

        /// Log actions instead of performing them
        #[arg(long = "dry-run")]
        dry_run: bool,
    },

    /// Compile a project's graph and print the resulting order
    Compile {
        #[arg(short = 'p', long = "project")]
        project: PathBuf,

        /// Fail when nodes are left off the compiled path
        #[arg(long = "strict")]
        strict: bool,

        /// Store the compiled steps back into the project file
        #[arg(long = "write")]
        write: bool,
    },

    /// Print the JSON Schema for the settings file and exit
    PrintSchema,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    match args.log_level.as_deref() {
        Some(level) => {
            clickflow::init_tracing_with_level(
                clickflow::parse_level(level).unwrap_or(tracing::Level::INFO),
            );
        }
        None => clickflow::init_tracing(),
    }

    let settings = match &args.settings {
        Some(path) => cfg::load_from_path_async(path).await?,
        None => Settings::default(),
    };
    debug!(target: "clickflow", ?settings, "Settings loaded");

    match args.command {
        Command::PrintSchema => {
            let schema = cfg::generate_schema();
            let json = serde_json::to_string_pretty(&schema)?;
            println!("{json}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Compile {
            project,
            strict,
            write,
        } => compile_project(&project, &settings, strict, write),
        Command::Run { project, dry_run } => {
            let settings = Settings {
                dry_run: settings.dry_run || dry_run,
                ..settings
            };
            run_project(&project, settings).await
        }
    }
}

fn compile_project(
    path: &Path,
    settings: &Settings,
    strict: bool,
    write: bool,
) -> anyhow::Result<ExitCode> {
    let doc = project::load_document_from_path(path)?;
    let graph = FlowGraph::from_document(&doc, &settings.images_dir)?;
    let options = if strict {
        CompileOptions::strict()
    } else {
        CompileOptions::default()
    };
    let sequence = compile_with(&graph, options)
        .with_context(|| format!("Failed to compile {}", path.display()))?;

    for (i, name) in sequence.names().iter().enumerate() {
        println!("Step{}: {name}", i + 1);
    }
    if write {
        project::save_project(&graph, &sequence, path)?;
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_project(path: &Path, settings: Settings) -> anyhow::Result<ExitCode> {
    let sequence = load_sequence(path, &settings)?;
    info!(
        version = clickflow::PKG_VERSION,
        project = %path.display(),
        steps = sequence.len(),
        mode = ?settings.detect_mode,
        dry_run = settings.dry_run,
        "Starting Clickflow"
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let mut handle = spawn_run(
        move || SequenceRunner::from_settings(&settings, None),
        sequence,
        EventSink::new(tx),
        cancel.clone(),
    );

    let progress = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            report(&event);
        }
    });

    let result = tokio::select! {
        joined = &mut handle => joined,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, cancelling run");
            cancel.cancel();
            handle.await
        }
    }
    .context("Run worker panicked")??;
    let _ = progress.await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// The project's stored steps, or its compiled graph when it stores none.
fn load_sequence(path: &Path, settings: &Settings) -> anyhow::Result<CompiledSequence> {
    let doc = project::load_document_from_path(path)?;
    if let Some(steps) = doc.steps.as_ref().filter(|s| !s.0.is_empty()) {
        // Stored locations are relative to the working directory.
        return project::steps_from_doc(steps, Path::new(""));
    }
    warn!(project = %path.display(), "No stored steps; compiling the graph");
    let graph = FlowGraph::from_document(&doc, &settings.images_dir)?;
    compile_with(&graph, CompileOptions::default())
        .with_context(|| format!("Failed to compile {}", path.display()))
}

fn report(event: &RunEvent) {
    match event {
        RunEvent::StepStarted { index, total, name } => {
            info!(target: "clickflow", "Step {}/{}: {name}", index + 1, total);
        }
        RunEvent::BelowThreshold {
            index,
            confidence,
            remaining,
        } => {
            debug!(
                target: "clickflow",
                step = index + 1,
                "Best match {confidence:.3}, {}s left",
                remaining.as_secs()
            );
        }
        RunEvent::StepFailed { reason, .. } => warn!(target: "clickflow", "{reason}"),
        other => debug!(target: "clickflow", event = ?other, "Run event"),
    }
}
