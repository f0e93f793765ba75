//! Pipe ends and tenant-scoped pipe identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the two fixed roles of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum End {
    Ui,
    Probe,
}

impl End {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ui => "ui",
            Self::Probe => "probe",
        }
    }
}

impl fmt::Display for End {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pipe identifier scoped to a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipeId {
    pub tenant: String,
    pub id: String,
}

impl PipeId {
    pub fn new(tenant: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            id: id.into(),
        }
    }

    /// The store key for this pipe under `prefix`.
    pub fn key(&self, prefix: &str) -> String {
        format!("{prefix}{}-{}", self.tenant, self.id)
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.id)
    }
}
