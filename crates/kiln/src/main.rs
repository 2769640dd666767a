use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use kiln::config::{AppConfig, config_file_path, write_default_config};
use kiln::container::ContainerRuntimeApi;
use kiln::db::Database;
use kiln::executor::{ContainerExecutor, EventStream, SandboxBackend};
use kiln::pipeline::{GitCli, Pipeline, PipelineSettings};
use kiln::sandbox::{ContainerManager, HttpHealthProbe};
use kiln_protocol::StreamEvent;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: Command) -> Result<()> {
    match command {
        Command::Doctor => handle_doctor(&ctx).await,
        Command::Sandbox { command } => handle_sandbox(&ctx, command).await,
        Command::Module { command } => handle_module(&ctx, command).await,
        Command::Spec(cmd) => handle_spec(&ctx, cmd).await,
        Command::Build(cmd) => handle_build(&ctx, cmd).await,
        Command::Versions(cmd) => handle_versions(&ctx, cmd).await,
        Command::Config { command } => handle_config(&ctx, command),
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common)?;
    ctx.init_logging();
    debug!(config_file = %ctx.config_file.display(), "configuration loaded");

    async_main(ctx, cli.command)
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Kiln - sandboxed spec, code and commit pipeline.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Check that the container runtime is usable
    Doctor,
    /// Manage sandbox containers directly
    Sandbox {
        #[command(subcommand)]
        command: SandboxCommand,
    },
    /// Manage modules
    Module {
        #[command(subcommand)]
        command: ModuleCommand,
    },
    /// Generate (or regenerate) a module's spec
    Spec(SpecCommand),
    /// Build a version whose spec is generated
    Build(BuildCommand),
    /// List a module's versions
    Versions(VersionsCommand),
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Subcommand)]
enum SandboxCommand {
    /// Start (or reuse) a session's container and run its bootstrap script
    Up {
        session: String,
        #[arg(value_name = "PATH")]
        workspace: PathBuf,
    },
    /// Remove a session's container
    Down { session: String },
    /// Probe a session's health endpoint
    Health { session: String },
    /// List containers owned by this instance
    List,
}

#[derive(Debug, Subcommand)]
enum ModuleCommand {
    /// Create a module
    Create { name: String },
    /// Delete a module, its versions and its sandbox
    Delete { id: String },
}

#[derive(Debug, Clone, Args)]
struct SpecCommand {
    module_id: String,
    /// Prompt describing the module
    prompt: String,
}

#[derive(Debug, Clone, Args)]
struct BuildCommand {
    version_id: String,
}

#[derive(Debug, Clone, Args)]
struct VersionsCommand {
    module_id: String,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = config_file_path(common.config.as_deref())?;
        let config = AppConfig::load_or_init(&config_file)?;
        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let level = self.effective_log_level();
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("kiln={level}")));

        // Logs go to stderr; stdout carries command output.
        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let disable_color = self.common.no_color
                || env::var_os("NO_COLOR").is_some()
                || !io::stderr().is_terminal();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.verbose > 1),
                )
                .try_init()
                .ok();
        }
    }

    fn effective_log_level(&self) -> &str {
        if self.common.quiet {
            "error"
        } else if self.common.trace {
            "trace"
        } else if self.common.debug {
            "debug"
        } else {
            match self.common.verbose {
                0 => self.config.logging.level.as_str(),
                1 => "debug",
                _ => "trace",
            }
        }
    }

    fn manager(&self) -> Result<Arc<ContainerManager>> {
        let runtime: Arc<dyn ContainerRuntimeApi> = Arc::new(self.config.runtime.build());
        let probe = HttpHealthProbe::new(self.config.sandbox.probe_timeout())?;
        Ok(Arc::new(ContainerManager::new(
            runtime,
            Arc::new(probe),
            self.config.sandbox.clone(),
        )))
    }

    fn executor(&self) -> Result<ContainerExecutor> {
        Ok(ContainerExecutor::new(self.manager()?)?)
    }

    async fn database(&self) -> Result<Database> {
        Database::new(&self.config.database_path()?).await
    }

    async fn pipeline(&self) -> Result<Pipeline> {
        let db = self.database().await?;
        Ok(Pipeline::new(
            Arc::new(self.executor()?),
            &db,
            Arc::new(GitCli::default()),
            PipelineSettings::from_config(&self.config)?,
        ))
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serializing output to JSON")?
    );
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                print_json(&ctx.config)
            } else {
                print!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
                Ok(())
            }
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
        ConfigCommand::Init { force } => {
            if ctx.config_file.exists() && !force {
                info!(path = %ctx.config_file.display(), "config already exists, use --force to overwrite");
                return Ok(());
            }
            write_default_config(&ctx.config_file)?;
            println!("{}", ctx.config_file.display());
            Ok(())
        }
    }
}

async fn handle_doctor(ctx: &RuntimeContext) -> Result<()> {
    let runtime = ctx.config.runtime.build();
    let binary = runtime.runtime_type();
    match runtime.version().await {
        Ok(version) => {
            println!("{binary}: {version}");
            println!("config: {}", ctx.config_file.display());
            println!("database: {}", ctx.config.database_path()?.display());
            println!("workspaces: {}", ctx.config.workspace_root()?.display());
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("{binary} is not usable")),
    }
}

async fn handle_sandbox(ctx: &RuntimeContext, command: SandboxCommand) -> Result<()> {
    match command {
        SandboxCommand::Up { session, workspace } => {
            let workspace = std::path::absolute(&workspace)
                .with_context(|| format!("resolving workspace {}", workspace.display()))?;
            tokio::fs::create_dir_all(&workspace)
                .await
                .with_context(|| format!("creating workspace {}", workspace.display()))?;

            let executor = ctx.executor()?;
            let (info, bootstrap) = executor.create_workspace(&session, &workspace).await?;
            print_json(&info)?;
            if let Some(handle) = bootstrap {
                info!(container = %info.name, "waiting for bootstrap script");
                let outcome = handle.wait().await;
                info!(container = %info.name, ?outcome, "bootstrap finished");
            }
            Ok(())
        }
        SandboxCommand::Down { session } => {
            let removed = ctx.executor()?.cleanup(&session).await?;
            if !removed {
                warn!(%session, "no container to remove");
            }
            Ok(())
        }
        SandboxCommand::Health { session } => {
            let status = ctx.manager()?.health_check(&session).await?;
            println!("{status}");
            Ok(())
        }
        SandboxCommand::List => {
            let containers = ctx.manager()?.list_owned().await?;
            if ctx.common.json {
                return print_json(&containers);
            }
            for c in containers {
                println!("{}\t{}\t{}\t{}", c.id, c.name, c.state, c.ports);
            }
            Ok(())
        }
    }
}

async fn handle_module(ctx: &RuntimeContext, command: ModuleCommand) -> Result<()> {
    match command {
        ModuleCommand::Create { name } => {
            let pipeline = ctx.pipeline().await?;
            let module = pipeline.modules().create(&name).await?;
            print_json(&module)
        }
        ModuleCommand::Delete { id } => {
            let pipeline = ctx.pipeline().await?;
            let marked = pipeline.delete_module(&id).await?;
            info!(module = %id, versions = marked, "module deleted");
            Ok(())
        }
    }
}

/// Token cancelled on the first Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            child.cancel();
        }
    });
    token
}

/// Print every event as a JSON line. Fails when the stream ended in an error.
async fn drain(mut events: EventStream) -> Result<()> {
    let mut last: Option<StreamEvent> = None;
    while let Some(event) = events.next().await {
        println!(
            "{}",
            serde_json::to_string(&event).context("serializing event")?
        );
        last = Some(event);
    }
    match last {
        Some(event) if event.is_error() => {
            anyhow::bail!("{}", event.content_text().unwrap_or("task failed"))
        }
        _ => Ok(()),
    }
}

async fn handle_spec(ctx: &RuntimeContext, cmd: SpecCommand) -> Result<()> {
    let pipeline = ctx.pipeline().await?;
    ensure_workspace(&pipeline.workspace(&cmd.module_id)).await?;
    let events = pipeline
        .generate_spec(&cmd.module_id, &cmd.prompt, ctrl_c_token())
        .await?;
    drain(events).await
}

async fn handle_build(ctx: &RuntimeContext, cmd: BuildCommand) -> Result<()> {
    let pipeline = ctx.pipeline().await?;
    let events = pipeline.build_code(&cmd.version_id, ctrl_c_token()).await?;
    drain(events).await
}

async fn handle_versions(ctx: &RuntimeContext, cmd: VersionsCommand) -> Result<()> {
    let pipeline = ctx.pipeline().await?;
    let versions = pipeline.versions().list_for_module(&cmd.module_id).await?;
    if ctx.common.json {
        return print_json(&versions);
    }
    for v in versions {
        println!(
            "{}\t{}\t{}\t{}",
            v.code,
            v.status,
            v.id,
            v.commit.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn ensure_workspace(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("creating workspace {}", path.display()))
}
