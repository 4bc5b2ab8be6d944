//! RBAC data models: permissions, permission sets, and roles.

use crate::membership::models::RoleId;
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// Permission
// ═══════════════════════════════════════════════════════════════════════════════

/// Pattern for canonical permission names: `resource.action`.
fn permission_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z_]+\.[a-z_]+$").unwrap_or_else(|_| unreachable!("pattern is valid"))
    })
}

/// Error parsing a permission name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid permission name '{0}': expected 'resource.action'")]
pub struct PermissionParseError(pub String);

/// A permission, identified by resource and action.
///
/// The canonical name is `resource.action` (e.g. `content.create`,
/// `user.manage`). Both parts are lowercase words, underscores allowed.
/// Wildcards are not part of the grammar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Permission {
    resource: String,
    action: String,
}

impl Permission {
    /// Parse a permission from its canonical `resource.action` name.
    pub fn parse(name: &str) -> Result<Self, PermissionParseError> {
        if !permission_name_pattern().is_match(name) {
            return Err(PermissionParseError(name.to_string()));
        }
        let (resource, action) = name
            .split_once('.')
            .ok_or_else(|| PermissionParseError(name.to_string()))?;
        Ok(Self {
            resource: resource.to_string(),
            action: action.to_string(),
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    /// The canonical `resource.action` name.
    pub fn name(&self) -> String {
        format!("{}.{}", self.resource, self.action)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.action)
    }
}

impl FromStr for Permission {
    type Err = PermissionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// Permissions serialize as their canonical name.
impl Serialize for Permission {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

impl<'de> Deserialize<'de> for Permission {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Permission::parse(&name).map_err(de::Error::custom)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Permission Set
// ═══════════════════════════════════════════════════════════════════════════════

/// An immutable-by-convention set of permissions.
///
/// This is what resolution produces and what the fine cache stores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet(HashSet<Permission>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, permission: &Permission) -> bool {
        self.0.contains(permission)
    }

    pub fn insert(&mut self, permission: Permission) -> bool {
        self.0.insert(permission)
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = Permission>) {
        self.0.extend(other);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical names, sorted for stable output.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.0.iter().map(Permission::name).collect();
        names.sort();
        names
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for PermissionSet {
    type Item = Permission;
    type IntoIter = std::collections::hash_set::IntoIter<Permission>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Role
// ═══════════════════════════════════════════════════════════════════════════════

/// A role in the catalog. Permissions are attached through catalog grants,
/// not stored on the role itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// System roles cannot be removed from the catalog.
    pub is_system: bool,
}

impl Role {
    pub fn new(id: impl Into<RoleId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            is_system: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark as a system role.
    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
