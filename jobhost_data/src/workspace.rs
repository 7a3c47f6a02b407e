use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub type WorkspaceId = u64;

/// How a workspace gets its runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    /// commands run with whatever the host provides
    Host,
    /// interpreter directory inside the workspace (`venv/`)
    #[default]
    Isolated,
    /// environment-manager prefix inside the workspace (`env/`)
    Prefix,
    /// container image built from the workspace
    Container,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub id: WorkspaceId,
    pub name: String,
    pub root: PathBuf,
    #[serde(default)]
    pub environment: EnvironmentKind,
    /// e.g. "3.11", `None` means whatever the host defaults to
    #[serde(default)]
    pub python_version: Option<String>,
}

impl WorkspaceConfig {
    pub fn new(id: WorkspaceId, name: &str, root: PathBuf, environment: EnvironmentKind) -> Self {
        Self {
            id,
            name: name.to_string(),
            root,
            environment,
            python_version: None,
        }
    }

    /// directory holding the provisioned interpreter, if the kind has one
    pub fn environment_dir(&self) -> Option<PathBuf> {
        match self.environment {
            EnvironmentKind::Isolated => Some(self.root.join("venv")),
            EnvironmentKind::Prefix => Some(self.root.join("env")),
            EnvironmentKind::Host | EnvironmentKind::Container => None,
        }
    }

    pub fn image_name(&self) -> String {
        format!("jobhost-workspace-{}", self.id)
    }
}
