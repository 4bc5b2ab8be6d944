//! Core identity and membership data models.
//!
//! Every ID is a newtype over `String` so that user, academy, department,
//! and role identifiers cannot be mixed up at compile time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════════════
// Identifier Newtypes
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

id_newtype! {
    /// Identifies a user (the authenticated principal).
    UserId
}

id_newtype! {
    /// Identifies an academy (the tenant boundary).
    AcademyId
}

id_newtype! {
    /// Identifies a department within an academy.
    DepartmentId
}

id_newtype! {
    /// Identifies a role in the role catalog.
    RoleId
}

// ═══════════════════════════════════════════════════════════════════════════════
// Membership Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle status of an academy membership.
///
/// Only `Active` memberships resolve permissions; every other status denies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipStatus {
    Active,
    Pending,
    Suspended,
    Archived,
}

impl MembershipStatus {
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Suspended => "suspended",
            Self::Archived => "archived",
        }
    }

    /// Parse a status from its storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "pending" => Some(Self::Pending),
            "suspended" => Some(Self::Suspended),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

impl fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Membership
// ═══════════════════════════════════════════════════════════════════════════════

/// A user's membership in an academy.
///
/// Keyed by `(user_id, academy_id)`; a user holds at most one membership per
/// academy. `custom_permissions` maps permission names to grants — entries
/// with value `true` add to the role-derived permission set (grants only;
/// a `false` entry is inert and a revoke removes the entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: UserId,
    pub academy_id: AcademyId,
    pub role_id: RoleId,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub department_id: Option<DepartmentId>,

    pub status: MembershipStatus,

    /// Per-membership permission grants, keyed by permission name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_permissions: BTreeMap<String, bool>,

    pub joined_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Membership {
    /// Create a new active membership.
    pub fn new(
        user_id: impl Into<UserId>,
        academy_id: impl Into<AcademyId>,
        role_id: impl Into<RoleId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            academy_id: academy_id.into(),
            role_id: role_id.into(),
            department_id: None,
            status: MembershipStatus::Active,
            custom_permissions: BTreeMap::new(),
            joined_at: now,
            updated_at: now,
        }
    }

    /// Set the department.
    pub fn with_department(mut self, department_id: impl Into<DepartmentId>) -> Self {
        self.department_id = Some(department_id.into());
        self
    }

    /// Set the status.
    pub fn with_status(mut self, status: MembershipStatus) -> Self {
        self.status = status;
        self
    }

    /// Add a custom permission grant.
    pub fn with_custom_permission(mut self, name: impl Into<String>) -> Self {
        self.custom_permissions.insert(name.into(), true);
        self
    }

    /// Whether this membership resolves permissions.
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Names of granted custom permissions (entries with value `true`).
    pub fn granted_custom_permissions(&self) -> impl Iterator<Item = &str> {
        self.custom_permissions
            .iter()
            .filter(|(_, allowed)| **allowed)
            .map(|(name, _)| name.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
