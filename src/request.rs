//! Run requests submitted as JSON documents
use crate::types::{EnvironmentConfig, ResourceLimitSet, Result, RunExecError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete description of one run, as accepted by [`crate::RunExecutor::execute_request`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunRequest {
    pub command: Vec<String>,
    #[serde(default)]
    pub limits: ResourceLimitSet,
    pub output_path: PathBuf,
    #[serde(default)]
    pub cpu_index: Option<u32>,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub max_log_size: Option<u64>,
}

impl RunRequest {
    pub fn new(command: Vec<String>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            command,
            limits: ResourceLimitSet::default(),
            output_path: output_path.into(),
            cpu_index: None,
            environment: EnvironmentConfig::default(),
            working_dir: None,
            max_log_size: None,
        }
    }

    /// Parse and validate a JSON run request
    pub fn from_json(json: &str) -> Result<Self> {
        let request: Self = serde_json::from_str(json).map_err(|e| RunExecError::Request(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<()> {
        match self.command.first() {
            None => Err(RunExecError::Request("command must not be empty".to_string())),
            Some(program) if program.is_empty() => {
                Err(RunExecError::Request("program name must not be empty".to_string()))
            }
            Some(_) if self.limits.cpu_core_count == Some(0) => {
                Err(RunExecError::Request("cpu_core_count must be positive".to_string()))
            }
            Some(_) => Ok(()),
        }
    }
}
