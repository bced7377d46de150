//! Database models for enrolled identities.

use crate::biometric::BiometricTemplate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of an enrolled person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Worker,
    Supervisor,
}

impl Role {
    /// Convert the role to its stored string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Supervisor => "supervisor",
        }
    }

    /// Parse a role from its stored string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "worker" => Some(Self::Worker),
            "supervisor" => Some(Self::Supervisor),
            _ => None,
        }
    }
}

/// An enrolled person bound to a face template.
///
/// `local_id` is generated on this device and never changes. `remote_id` is
/// assigned once by the remote directory and is never cleared afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub local_id: String,
    pub remote_id: Option<String>,
    pub display_name: String,
    pub role: Role,
    pub template: BiometricTemplate,
    pub enrolled_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Identity {
    /// Build a not-yet-enrolled identity with a fresh local id.
    pub fn new(
        display_name: impl Into<String>,
        role: Role,
        template: BiometricTemplate,
        enrolled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            local_id: Uuid::new_v4().to_string(),
            remote_id: None,
            display_name: display_name.into(),
            role,
            template,
            enrolled_at,
            last_synced_at: None,
        }
    }

    pub fn is_supervisor(&self) -> bool {
        self.role == Role::Supervisor
    }
}
