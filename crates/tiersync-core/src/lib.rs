//! Core hierarchy model for tiersync: upstream records, stored rows and identity keys.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tiersync-core";

/// Store-assigned row identifier.
pub type RowId = i64;

/// Top-level upstream record. Unknown upstream fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRecord {
    pub name: String,
    #[serde(default)]
    pub username: Option<String>,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrandchildRecord {
    pub name: String,
    pub email: String,
    pub body: String,
}

/// Persisted parent row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parent {
    pub id: RowId,
    pub name: String,
    pub username: Option<String>,
    pub email: String,
}

/// Persisted child row; `parent_id` always references an existing parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Child {
    pub id: RowId,
    pub parent_id: RowId,
    pub title: String,
    pub body: String,
}

/// Persisted grandchild row; `child_id` always references an existing child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grandchild {
    pub id: RowId,
    pub child_id: RowId,
    pub name: String,
    pub email: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Parent,
    Child,
    Grandchild,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Parent => "parent",
            Level::Child => "child",
            Level::Grandchild => "grandchild",
        };
        f.write_str(name)
    }
}

/// Fields that decide whether an incoming record already exists at its level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaturalKey<'a> {
    Parent { email: &'a str },
    Child { parent_id: RowId, title: &'a str },
    Grandchild { child_id: RowId, body: &'a str },
}

impl NaturalKey<'_> {
    pub fn level(&self) -> Level {
        match self {
            NaturalKey::Parent { .. } => Level::Parent,
            NaturalKey::Child { .. } => Level::Child,
            NaturalKey::Grandchild { .. } => Level::Grandchild,
        }
    }
}

/// How a child's stored title (its natural key within a parent) is derived.
///
/// `Salted` appends the cycle timestamp, so every cycle stores fresh children
/// even when upstream titles repeat. `Plain` keeps the upstream title and lets
/// repeated cycles resolve to the existing child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildKeyPolicy {
    #[default]
    Salted,
    Plain,
}

impl ChildKeyPolicy {
    pub fn stored_title(&self, title: &str, cycle_started_at: DateTime<Utc>) -> String {
        match self {
            ChildKeyPolicy::Salted => format!("{title}-{}", cycle_started_at.timestamp_millis()),
            ChildKeyPolicy::Plain => title.to_string(),
        }
    }
}

impl FromStr for ChildKeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "salted" => Ok(ChildKeyPolicy::Salted),
            "plain" => Ok(ChildKeyPolicy::Plain),
            other => Err(format!("unknown child key policy `{other}` (expected salted|plain)")),
        }
    }
}

/// Positional slicing of a fetched batch into units.
///
/// Unit `i` takes parent `i` and children `i * children_per_parent + j`.
/// Grandchildren are drawn by the child's position inside its unit,
/// `j * grandchildren_per_child + k`, so every unit reuses the same
/// grandchild slice for its `j`-th child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLayout {
    pub units_per_cycle: usize,
    pub children_per_parent: usize,
    pub grandchildren_per_child: usize,
}

impl Default for BatchLayout {
    fn default() -> Self {
        Self {
            units_per_cycle: 500,
            children_per_parent: 10,
            grandchildren_per_child: 10,
        }
    }
}

impl BatchLayout {
    /// Flat index of child `j` of `unit`; `None` when it does not fit in `usize`,
    /// which callers treat like an exhausted batch.
    pub fn child_index(&self, unit: usize, j: usize) -> Option<usize> {
        unit.checked_mul(self.children_per_parent)?.checked_add(j)
    }

    pub fn grandchild_index(&self, j: usize, k: usize) -> Option<usize> {
        j.checked_mul(self.grandchildren_per_child)?.checked_add(k)
    }
}
