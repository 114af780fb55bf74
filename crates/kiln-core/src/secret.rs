//! Secret resolution.
//!
//! Secret variables reach a worker exactly once: in the response to a
//! successful, committed take.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::job::Job;

/// Where a variable is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableScope {
    Project,
    Application,
    Environment,
}

impl VariableScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariableScope::Project => "project",
            VariableScope::Application => "application",
            VariableScope::Environment => "environment",
        }
    }

    /// Prefix of the name under which the worker sees the variable.
    pub fn prefix(&self) -> &'static str {
        match self {
            VariableScope::Project => "proj",
            VariableScope::Application => "app",
            VariableScope::Environment => "env",
        }
    }
}

impl std::str::FromStr for VariableScope {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "project" => Ok(VariableScope::Project),
            "application" => Ok(VariableScope::Application),
            "environment" => Ok(VariableScope::Environment),
            other => Err(crate::Error::Internal(format!(
                "unknown variable scope '{}'",
                other
            ))),
        }
    }
}

/// A resolved variable as handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    /// Fully qualified name, e.g. `proj.registry_password`.
    pub name: String,
    pub value: String,
    pub scope: VariableScope,
}

impl Variable {
    pub fn qualified_name(scope: VariableScope, name: &str) -> String {
        format!("{}.{}", scope.prefix(), name)
    }
}

/// Backend that knows the secret variables of a job's project, application
/// and environment.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, job: &Job) -> Result<Vec<Variable>>;
}
