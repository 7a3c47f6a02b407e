use std::path::PathBuf;

use jobhost_lib::{config::RunnerConfig, EnvironmentKind, JobId, JobStatus};
use structopt::StructOpt;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::state::Host;

mod operations;
mod state;

/// Runs shell jobs against local workspaces
#[derive(StructOpt, Debug)]
#[structopt(name = "jobhost")]
struct Opt {
    /// TOML file with runner settings
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Debug, StructOpt)]
enum Operation {
    /// run a command and follow its log
    Run(RunOperation),
    /// run the scheduler over a tasks file until interrupted
    Schedule(ScheduleOperation),
    /// open an interactive shell session
    Shell(ShellOperation),
    /// print the tail of a job log
    Tail(TailOperation),
    /// list cron presets
    Presets(PresetsOperation),
}

#[derive(Debug, StructOpt)]
struct WorkspaceArgs {
    #[structopt(long, parse(from_os_str), default_value = ".")]
    workspace: PathBuf,
    /// host, isolated, prefix or container
    #[structopt(long = "env", default_value = "host", parse(try_from_str = parse_environment))]
    environment: EnvironmentKind,
    /// python version pin, e.g. 3.11
    #[structopt(long)]
    python: Option<String>,
}

#[derive(Debug, StructOpt)]
struct RunOperation {
    #[structopt(flatten)]
    workspace: WorkspaceArgs,
    #[structopt(name = "COMMAND", required = true)]
    command: Vec<String>,
}

#[derive(Debug, StructOpt)]
struct ScheduleOperation {
    #[structopt(flatten)]
    workspace: WorkspaceArgs,
    #[structopt(name = "TASKS FILE", parse(from_os_str))]
    tasks: PathBuf,
}

#[derive(Debug, StructOpt)]
struct ShellOperation {}

#[derive(Debug, StructOpt)]
struct TailOperation {
    #[structopt(name = "JOB ID")]
    job_id: JobId,
    #[structopt(long)]
    lines: Option<usize>,
}

#[derive(Debug, StructOpt)]
struct PresetsOperation {}

fn parse_environment(text: &str) -> Result<EnvironmentKind, String> {
    match text.to_ascii_lowercase().as_str() {
        "host" => Ok(EnvironmentKind::Host),
        "isolated" | "venv" => Ok(EnvironmentKind::Isolated),
        "prefix" | "conda" => Ok(EnvironmentKind::Prefix),
        "container" | "docker" => Ok(EnvironmentKind::Container),
        other => Err(format!("unknown environment kind '{}'", other)),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let opt = Opt::from_args();
    let config = match &opt.config {
        Some(path) => RunnerConfig::load(path)?,
        None => RunnerConfig::default(),
    }
    .with_env_overrides()?;
    let host = Host::new(config).await?;

    match opt.operation {
        Operation::Run(run) => {
            let args = run.workspace;
            let workspace = host
                .workspace(&args.workspace, args.environment, args.python)
                .await?;
            let status = operations::run(&host, workspace, &run.command.join(" ")).await?;
            if status != JobStatus::Completed {
                std::process::exit(1);
            }
        }
        Operation::Schedule(schedule) => {
            let args = schedule.workspace;
            let workspace = host
                .workspace(&args.workspace, args.environment, args.python)
                .await?;
            operations::schedule(&host, workspace, &schedule.tasks).await?;
        }
        Operation::Shell(_) => operations::shell(&host).await?,
        Operation::Tail(tail) => operations::tail(&host, tail.job_id, tail.lines).await?,
        Operation::Presets(_) => operations::presets(),
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use jobhost_lib::EnvironmentKind;

    use super::parse_environment;

    #[test]
    fn test_parse_environment() {
        assert_eq!(Ok(EnvironmentKind::Isolated), parse_environment("venv"));
        assert_eq!(Ok(EnvironmentKind::Container), parse_environment("Docker"));
        assert!(parse_environment("vm").is_err());
    }
}
