//! Monitored entities: kinds, priorities, classification and the registry.

pub mod classifier;
pub mod registry;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::detect::DetectError;

pub use self::classifier::Classifier;
pub use self::registry::EntityRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Numeric,
    Binary,
    Categorical,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Numeric => write!(f, "numeric"),
            EntityKind::Binary => write!(f, "binary"),
            EntityKind::Categorical => write!(f, "categorical"),
        }
    }
}

impl FromStr for EntityKind {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "numeric" => Ok(EntityKind::Numeric),
            "binary" => Ok(EntityKind::Binary),
            "categorical" => Ok(EntityKind::Categorical),
            other => Err(DetectError::Storage(format!("unknown entity kind '{other}'"))),
        }
    }
}

/// Which evaluation tier an entity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Standard,
    #[serde(rename = "priority")]
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Standard => write!(f, "standard"),
            Priority::High => write!(f, "priority"),
        }
    }
}

impl FromStr for Priority {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Priority::Standard),
            "priority" | "high" => Ok(Priority::High),
            other => Err(DetectError::Configuration(format!("unknown priority '{other}'"))),
        }
    }
}

/// How an entity came to be monitored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Configured,
    User,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Configured => write!(f, "configured"),
            Origin::User => write!(f, "user"),
        }
    }
}

impl FromStr for Origin {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "configured" => Ok(Origin::Configured),
            "user" => Ok(Origin::User),
            other => Err(DetectError::Storage(format!("unknown entity origin '{other}'"))),
        }
    }
}

/// A monitored entity. `kind` is fixed once classified; changing it goes
/// through an explicit reclassification that also invalidates the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    pub priority: Priority,
    pub enabled: bool,
    pub origin: Origin,
    /// Set when classification rejected the entity as unsuitable for
    /// modeling. Such entities are skipped by every tier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsuitable: Option<String>,
}

impl Entity {
    pub fn new(id: &str, kind: EntityKind, priority: Priority, origin: Origin) -> Self {
        Self {
            id: id.to_string(),
            kind,
            priority,
            enabled: true,
            origin,
            unsuitable: None,
        }
    }

    pub fn is_modelable(&self) -> bool {
        self.unsuitable.is_none()
    }
}
