//! Makes sure a workspace has a runnable interpreter before a job starts.

use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use async_trait::async_trait;
use jobhost_data::{EnvironmentKind, JobId, WorkspaceConfig};
use tokio::{fs, process::Command, sync::mpsc};
use tracing::{info, instrument, warn};

use crate::{error::ProvisionError, log_hub::LogHub, stream};

const DEFAULT_DOCKERFILE: &str = "FROM python:3.11-slim

WORKDIR /app

COPY requirements.txt* ./
RUN pip install --no-cache-dir -r requirements.txt 2>/dev/null || true

COPY . .

CMD [\"python\", \"main.py\"]
";

const CONDA_LOCATIONS: &[&str] = &[
    "~/miniforge3/bin/conda",
    "~/miniconda3/bin/conda",
    "~/anaconda3/bin/conda",
    "/opt/homebrew/Caskroom/miniforge/base/bin/conda",
    "/usr/local/anaconda3/bin/conda",
];

/// Where provisioning output goes while a job waits for its environment.
pub struct ProvisionLog {
    pub hub: Arc<LogHub>,
    pub job_id: JobId,
}

impl ProvisionLog {
    async fn line(&self, text: &str) {
        if let Err(err) = self.hub.append(self.job_id, text).await {
            warn!("could not append to log of job {}: {}", self.job_id, err);
        }
    }
}

#[async_trait]
pub trait Provision: Send + Sync {
    /// succeeds if the workspace's environment is usable, creating it if needed
    async fn ensure(&self, workspace: &WorkspaceConfig, log: &ProvisionLog) -> Result<(), ProvisionError>;

    /// the shell command line that runs `command` inside the workspace's environment
    fn wrap_command(&self, workspace: &WorkspaceConfig, command: &str) -> String;
}

#[derive(Clone, Debug, Default)]
pub struct EnvironmentProvisioner;

impl EnvironmentProvisioner {
    pub fn new() -> Self {
        Self
    }

    async fn ensure_interpreter_dir(
        &self,
        workspace: &WorkspaceConfig,
        env_dir: &Path,
        log: &ProvisionLog,
    ) -> Result<(), ProvisionError> {
        if fs::metadata(env_dir).await.is_ok() {
            if interpreter_path(env_dir).exists() {
                return Ok(());
            }
            warn!(
                "environment {} exists but has no interpreter, recreating",
                env_dir.display()
            );
            fs::remove_dir_all(env_dir).await?;
        }
        if !workspace.root.is_dir() {
            return Err(ProvisionError::MissingWorkspace(workspace.root.clone()));
        }

        info!("creating {:?} environment at {}", workspace.environment, env_dir.display());
        match workspace.environment {
            EnvironmentKind::Prefix => {
                let conda = find_conda().ok_or(ProvisionError::ToolMissing("conda"))?;
                let python = match &workspace.python_version {
                    Some(version) => format!("python={}", version),
                    None => "python".to_string(),
                };
                let env_arg = env_dir.to_string_lossy().to_string();
                run_quiet(&conda, &["create", "-p", &env_arg, "-y", &python], &workspace.root).await?;
            }
            _ => {
                let python = find_python(workspace.python_version.as_deref())?;
                let env_arg = env_dir.to_string_lossy().to_string();
                run_quiet(&python, &["-m", "venv", &env_arg], &workspace.root).await?;
            }
        }

        if !interpreter_path(env_dir).exists() {
            return Err(ProvisionError::CommandFailed {
                command: format!("create environment {}", env_dir.display()),
                stderr: "interpreter missing after creation".to_string(),
            });
        }
        report_package_manager(&workspace.root, log).await;
        Ok(())
    }

    async fn ensure_image(&self, workspace: &WorkspaceConfig, log: &ProvisionLog) -> Result<(), ProvisionError> {
        let docker = Path::new("docker");
        run_quiet(docker, &["--version"], &workspace.root).await?;

        let has_build_file = ["Dockerfile", "docker-compose.yml", "docker-compose.yaml"]
            .iter()
            .any(|name| workspace.root.join(name).exists());
        if !has_build_file {
            warn!("no Dockerfile in {}, writing a default one", workspace.root.display());
            fs::write(workspace.root.join("Dockerfile"), DEFAULT_DOCKERFILE).await?;
        }

        let image = workspace.image_name();
        if run_quiet(docker, &["image", "inspect", &image], &workspace.root)
            .await
            .is_ok()
        {
            return Ok(());
        }

        log.line(&format!("Building Docker image {}...", image)).await;
        let mut process = Command::new(docker)
            .args(["build", "-t", image.as_str(), "."])
            .current_dir(&workspace.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let (lines_sender, lines_receiver) = mpsc::unbounded_channel();
        let readers = stream::read_output(&mut process, lines_sender);
        let drain = tokio::spawn(stream::drain_to_log(
            lines_receiver,
            Arc::clone(&log.hub),
            log.job_id,
        ));
        for reader in readers {
            let _ = reader.await;
        }
        let _ = drain.await;
        let status = process.wait().await?;
        if !status.success() {
            log.line(&format!("Docker build failed (exit code {:?})", status.code()))
                .await;
            return Err(ProvisionError::CommandFailed {
                command: format!("docker build -t {} .", image),
                stderr: format!("exit code {:?}", status.code()),
            });
        }
        log.line(&format!("Docker image {} built successfully", image)).await;
        Ok(())
    }
}

#[async_trait]
impl Provision for EnvironmentProvisioner {
    #[instrument(skip(self, log), fields(workspace = workspace.id))]
    async fn ensure(&self, workspace: &WorkspaceConfig, log: &ProvisionLog) -> Result<(), ProvisionError> {
        match (workspace.environment, workspace.environment_dir()) {
            (EnvironmentKind::Host, _) => Ok(()),
            (EnvironmentKind::Container, _) => self.ensure_image(workspace, log).await,
            (_, Some(env_dir)) => self.ensure_interpreter_dir(workspace, &env_dir, log).await,
            (_, None) => Ok(()),
        }
    }

    fn wrap_command(&self, workspace: &WorkspaceConfig, command: &str) -> String {
        let quoted = |path: &Path| shell_words::quote(&path.to_string_lossy()).to_string();
        match (workspace.environment, workspace.environment_dir()) {
            (EnvironmentKind::Prefix, Some(env_dir)) => match find_conda() {
                Some(conda) => format!(
                    "{} run -p {} --no-capture-output sh -c {}",
                    quoted(&conda),
                    quoted(&env_dir),
                    shell_words::quote(command)
                ),
                None => {
                    warn!("conda not found, activating {} directly", env_dir.display());
                    format!(". {} && {}", quoted(&env_dir.join("bin").join("activate")), command)
                }
            },
            (EnvironmentKind::Isolated, Some(env_dir)) => {
                format!(". {} && {}", quoted(&env_dir.join("bin").join("activate")), command)
            }
            (EnvironmentKind::Container, _) => format!(
                "docker run --rm -v {}:/app -w /app {} sh -c {}",
                quoted(&workspace.root),
                workspace.image_name(),
                shell_words::quote(command)
            ),
            _ => command.to_string(),
        }
    }
}

fn interpreter_path(env_dir: &Path) -> PathBuf {
    env_dir.join("bin").join("python")
}

async fn run_quiet(program: &Path, args: &[&str], cwd: &Path) -> Result<(), ProvisionError> {
    let command_line = format!("{} {}", program.display(), args.join(" "));
    let output = match Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .output()
        .await
    {
        Ok(output) => output,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ProvisionError::CommandFailed {
                command: command_line,
                stderr: "program not found".to_string(),
            })
        }
        Err(err) => return Err(err.into()),
    };
    if output.status.success() {
        Ok(())
    } else {
        Err(ProvisionError::CommandFailed {
            command: command_line,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// first executable called `name` on PATH
pub fn which(name: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

/// python<version>, python<major>, pyenv's build of the version, then python3/python
pub fn find_python(version: Option<&str>) -> Result<PathBuf, ProvisionError> {
    if let Some(version) = version {
        let major = version.split('.').next().unwrap_or(version);
        for candidate in [format!("python{}", version), format!("python{}", major)] {
            if let Some(path) = which(&candidate) {
                return Ok(path);
            }
        }
        let pyenv_root = env::var_os("PYENV_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| expand_home("~/.pyenv"));
        let pyenv_python = pyenv_root
            .join("versions")
            .join(version)
            .join("bin")
            .join("python");
        if pyenv_python.exists() {
            return Ok(pyenv_python);
        }
        warn!("python {} not found, using the system interpreter", version);
    }
    which("python3")
        .or_else(|| which("python"))
        .ok_or(ProvisionError::InterpreterNotFound)
}

/// mamba before conda, then well-known install locations
pub fn find_conda() -> Option<PathBuf> {
    which("mamba").or_else(|| which("conda")).or_else(|| {
        CONDA_LOCATIONS
            .iter()
            .map(|location| expand_home(location))
            .find(|path| path.exists())
    })
}

/// key/value pairs from the workspace's `.env`, an unreadable file yields nothing
pub fn load_env_file(workspace_root: &Path) -> HashMap<String, String> {
    match std::fs::read_to_string(workspace_root.join(".env")) {
        Ok(text) => parse_env(&text),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
        Err(err) => {
            warn!("could not load .env file: {}", err);
            HashMap::new()
        }
    }
}

fn parse_env(text: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim();
            let unquoted = if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                &value[1..value.len() - 1]
            } else {
                value
            };
            vars.insert(key.trim().to_string(), unquoted.replace("\\\"", "\""));
        }
    }
    vars
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageManager {
    pub kind: &'static str,
    pub install_command: &'static str,
    pub files_found: Vec<String>,
}

/// guesses how the workspace installs its dependencies
pub fn detect_package_manager(workspace_root: &Path) -> PackageManager {
    let mut files_found = Vec::new();
    let found = |name: &str| workspace_root.join(name).exists();

    if found("pyproject.toml") {
        files_found.push("pyproject.toml".to_string());
        let content = std::fs::read_to_string(workspace_root.join("pyproject.toml")).unwrap_or_default();
        if content.contains("[tool.poetry]") {
            return PackageManager {
                kind: "poetry",
                install_command: "poetry install",
                files_found,
            };
        }
        if content.contains("[project]") || content.contains("[tool.uv]") {
            return PackageManager {
                kind: "uv",
                install_command: "uv pip install -e .",
                files_found,
            };
        }
    }
    for name in ["environment.yml", "environment.yaml"] {
        if found(name) {
            files_found.push(name.to_string());
            return PackageManager {
                kind: "conda",
                install_command: "conda env update --file environment.yml",
                files_found,
            };
        }
    }
    if found("requirements.txt") {
        files_found.push("requirements.txt".to_string());
        return PackageManager {
            kind: "pip",
            install_command: "pip install -r requirements.txt",
            files_found,
        };
    }
    if found("setup.py") {
        files_found.push("setup.py".to_string());
        return PackageManager {
            kind: "pip",
            install_command: "pip install -e .",
            files_found,
        };
    }
    PackageManager {
        kind: "unknown",
        install_command: "pip install -r requirements.txt",
        files_found,
    }
}

/// tells the job log how a freshly provisioned workspace installs its dependencies
async fn report_package_manager(workspace_root: &Path, log: &ProvisionLog) -> PackageManager {
    let detected = detect_package_manager(workspace_root);
    if detected.kind != "unknown" {
        info!("detected {} project in {}", detected.kind, workspace_root.display());
        log.line(&format!(
            "Detected {} project ({}), install dependencies with: {}",
            detected.kind,
            detected.files_found.join(", "),
            detected.install_command
        ))
        .await;
    }
    detected
}
