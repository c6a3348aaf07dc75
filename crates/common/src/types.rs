//! Core types for uiproxy

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::Error;

/// Identity id as issued by the account service
pub type IdentityId = String;

/// Instance id as issued by the lifecycle manager
pub type InstanceId = String;

/// Role of an authenticated identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// May reach every instance.
    Admin,
    /// May reach only instances it owns.
    User,
}

impl Role {
    pub fn is_elevated(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::User
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::User => write!(f, "user"),
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            _ => Err(Error::InvalidValue {
                field: "role",
                value: s.to_string(),
            }),
        }
    }
}

/// Authenticated identity, held for the duration of one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: IdentityId,
    pub display_name: String,
    pub role: Role,
}

impl Principal {
    pub fn is_elevated(&self) -> bool {
        self.role.is_elevated()
    }

    /// Whether this principal may see an instance owned by `owner_id`.
    pub fn can_access(&self, owner_id: &str) -> bool {
        self.is_elevated() || self.id == owner_id
    }
}

/// Instance lifecycle status, as recorded by the lifecycle manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Stopped,
    Running,
    Stopping,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Stopped => write!(f, "stopped"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Stopping => write!(f, "stopping"),
        }
    }
}

impl FromStr for InstanceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stopped" => Ok(InstanceStatus::Stopped),
            "running" => Ok(InstanceStatus::Running),
            "stopping" => Ok(InstanceStatus::Stopping),
            _ => Err(Error::InvalidValue {
                field: "status",
                value: s.to_string(),
            }),
        }
    }
}

/// The parts of an instance record the proxy consumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub id: InstanceId,
    pub owner_id: IdentityId,
    pub status: InstanceStatus,
    /// Host port of the container UI. Only meaningful while running.
    pub port: Option<u16>,
}

impl InstanceDescriptor {
    /// The upstream port, if the instance is running and has one.
    pub fn running_port(&self) -> Option<u16> {
        match (self.status, self.port) {
            (InstanceStatus::Running, Some(port)) => Some(port),
            _ => None,
        }
    }
}
