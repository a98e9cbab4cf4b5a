//! Ostiary CLI - Command-line surface for the tool governance pipeline

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ostiary_core::config::{OstiaryConfig, StoreConfig};
use ostiary_core::governor::Governor;
use ostiary_core::llm::{ModelProvider, StubModelProvider};
use ostiary_core::policy::Role;
use ostiary_core::skills::SkillDefinition;
use ostiary_core::tools::{ErrorCode, InvocationContext, builtin::register_builtins};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ostiary")]
#[command(about = "Governed tool invocation for multi-tenant agents", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ostiary.toml and OSTIARY_* variables)
    #[arg(long, global = true, env = "OSTIARY_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Directory holding audit, budget and breaker state
    #[arg(long, global = true, default_value = ".ostiary")]
    state_dir: PathBuf,

    /// Register the echoing stub model provider as `model_complete`
    #[arg(long, global = true)]
    stub_provider: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Registered tools
    Tools {
        #[command(subcommand)]
        command: ToolsCommands,
    },
    /// Skill manifests
    Skills {
        #[command(subcommand)]
        command: SkillsCommands,
    },
    /// Invoke a tool through the full pipeline
    Invoke {
        #[command(flatten)]
        caller: Caller,
        /// Tool name
        #[arg(long)]
        tool: String,
        /// Input as JSON
        #[arg(long, default_value = "{}")]
        input: String,
    },
    /// Run the skill defined in a manifest
    RunSkill {
        /// YAML or JSON skill manifest
        #[arg(long)]
        manifest: PathBuf,
        #[command(flatten)]
        caller: Caller,
        /// Input as JSON
        #[arg(long, default_value = "{}")]
        input: String,
    },
    /// Audit trail
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
    /// Tenant budgets
    Budget {
        #[command(subcommand)]
        command: BudgetCommands,
    },
    /// Provider circuit breakers
    Breakers {
        #[command(subcommand)]
        command: BreakersCommands,
    },
    /// Version information
    Version,
}

#[derive(clap::Args)]
struct Caller {
    /// Tenant ID
    #[arg(long)]
    tenant: String,
    /// Caller role (viewer, auditor, operator, admin)
    #[arg(long, default_value = "viewer")]
    role: Role,
    /// Trace ID to join (a new one is generated otherwise)
    #[arg(long)]
    trace: Option<String>,
}

impl Caller {
    fn context(&self) -> InvocationContext {
        let ctx = InvocationContext::new(&self.tenant, self.role);
        match &self.trace {
            Some(trace) => ctx.with_trace_id(trace),
            None => ctx,
        }
    }
}

#[derive(Subcommand)]
enum ToolsCommands {
    /// List registered tools
    List,
}

#[derive(Subcommand)]
enum SkillsCommands {
    /// List the skills in a manifest
    List {
        #[arg(long)]
        manifest: PathBuf,
    },
}

#[derive(Subcommand)]
enum AuditCommands {
    /// Verify the hash chain
    Verify,
    /// Print audit records
    Show {
        /// Only records for this trace
        #[arg(long)]
        trace: Option<String>,
    },
}

#[derive(Subcommand)]
enum BudgetCommands {
    /// Show tenant budgets
    Show {
        /// Only this tenant
        #[arg(long)]
        tenant: Option<String>,
    },
}

#[derive(Subcommand)]
enum BreakersCommands {
    /// Show breaker states
    Show,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Logs go to stderr; stdout carries JSON
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("ostiary {}", env!("CARGO_PKG_VERSION"));
        println!("ostiary-core {}", ostiary_core::VERSION);
        return Ok(ExitCode::SUCCESS);
    }

    let governor = build_governor(&cli)?;

    match cli.command {
        Commands::Version => {}
        Commands::Tools {
            command: ToolsCommands::List,
        } => print_json(&governor.list_tools())?,
        Commands::Skills {
            command: SkillsCommands::List { manifest },
        } => {
            load_manifest(&governor, &manifest)?;
            print_json(&governor.list_skills())?;
        }
        Commands::Invoke {
            caller,
            tool,
            input,
        } => {
            let input = parse_input(&input)?;
            let envelope = governor.invoke(&caller.context(), &tool, input).await?;
            print_json(&envelope)?;
            return Ok(exit_code(envelope.error_code()));
        }
        Commands::RunSkill {
            manifest,
            caller,
            input,
        } => {
            let name = load_manifest(&governor, &manifest)?;
            let input = parse_input(&input)?;
            let result = match governor.run_skill(&caller.context(), &name, input).await {
                Ok(result) => result,
                Err(e) => {
                    eprintln!("{}", e);
                    return Ok(exit_code(Some(e.code())));
                }
            };
            print_json(&result)?;
            return Ok(exit_code(result.error.as_ref().map(|e| e.code)));
        }
        Commands::Audit {
            command: AuditCommands::Verify,
        } => {
            let report = governor.verify_audit();
            print_json(&report)?;
            if !report.valid {
                return Ok(exit_code(Some(ErrorCode::Internal)));
            }
        }
        Commands::Audit {
            command: AuditCommands::Show { trace },
        } => {
            let records = match trace {
                Some(trace) => governor.audit_for_trace(&trace),
                None => governor.audit_records(),
            };
            let records: Vec<_> = records.iter().map(|record| record.as_ref()).collect();
            print_json(&records)?;
        }
        Commands::Budget {
            command: BudgetCommands::Show { tenant },
        } => match tenant {
            Some(tenant) => print_json(&governor.budget_summary(&tenant))?,
            None => print_json(&governor.budget_summaries())?,
        },
        Commands::Breakers {
            command: BreakersCommands::Show,
        } => print_json(&governor.breaker_summaries())?,
    }

    Ok(ExitCode::SUCCESS)
}

fn build_governor(cli: &Cli) -> Result<Governor> {
    let mut config = match &cli.config {
        Some(path) => OstiaryConfig::from_file(path)?,
        None => OstiaryConfig::load()?,
    };
    if config.store == StoreConfig::Memory {
        config.store = StoreConfig::File {
            root: cli.state_dir.clone(),
        };
    }

    let provider: Option<Arc<dyn ModelProvider>> = cli
        .stub_provider
        .then(|| Arc::new(StubModelProvider::default()) as Arc<dyn ModelProvider>);
    let sandbox = config.sandbox.clone();

    let governor = Governor::builder()
        .config(config)
        .build()
        .context("Failed to start the governor")?;
    register_builtins(governor.registry(), &sandbox, provider)?;
    Ok(governor)
}

/// Register the skill in `path`, returning its name
fn load_manifest(governor: &Governor, path: &Path) -> Result<String> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read manifest {}", path.display()))?;
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    let definition = if is_json {
        SkillDefinition::from_json(&text)?
    } else {
        SkillDefinition::from_yaml(&text)?
    };
    let name = definition.name.clone();
    governor.registry().register_skill(definition)?;
    Ok(name)
}

fn parse_input(input: &str) -> Result<Value> {
    serde_json::from_str(input).context("--input must be valid JSON")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(code: Option<ErrorCode>) -> ExitCode {
    code.map_or(ExitCode::SUCCESS, |code| ExitCode::from(code.exit_code()))
}
