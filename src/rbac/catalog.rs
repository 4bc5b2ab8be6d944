//! The role catalog: an immutable snapshot of roles and their grants.
//!
//! The resolver reads one catalog snapshot per resolution; administrative
//! changes build a new snapshot and swap it in, so a resolution in flight
//! never observes a half-applied change.
//!
//! Grant scoping:
//!
//! | Grant | Applies to |
//! |-------|------------|
//! | global (`academy_id = None`) | every academy |
//! | academy-scoped | only that academy |
//! | department override | members of that `(academy, department)` — additive only |

use crate::membership::models::{AcademyId, DepartmentId, RoleId};
use crate::rbac::models::{Permission, PermissionSet, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ═══════════════════════════════════════════════════════════════════════════════
// Grants
// ═══════════════════════════════════════════════════════════════════════════════

/// A permission granted to a role, optionally scoped to one academy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGrant {
    pub permission: Permission,

    /// `None` grants the permission in every academy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub academy_id: Option<AcademyId>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Catalog
// ═══════════════════════════════════════════════════════════════════════════════

/// Immutable snapshot of the role catalog.
#[derive(Debug, Clone, Default)]
pub struct RoleCatalog {
    roles: HashMap<RoleId, Role>,
    grants: HashMap<RoleId, Vec<RoleGrant>>,
    department_overrides: HashMap<(AcademyId, DepartmentId), PermissionSet>,
}

impl RoleCatalog {
    pub fn builder() -> RoleCatalogBuilder {
        RoleCatalogBuilder::default()
    }

    /// Look up a role by id.
    pub fn role(&self, role_id: &RoleId) -> Option<&Role> {
        self.roles.get(role_id)
    }

    /// Look up a role by name, case-insensitively.
    pub fn role_by_name(&self, name: &str) -> Option<&Role> {
        self.roles
            .values()
            .find(|r| r.name.eq_ignore_ascii_case(name))
    }

    /// All roles in the catalog.
    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.roles.values()
    }

    /// Effective role permissions in an academy: global grants plus grants
    /// scoped to that academy. An unknown role contributes nothing.
    pub fn permissions_for(&self, role_id: &RoleId, academy_id: &AcademyId) -> PermissionSet {
        self.grants
            .get(role_id)
            .map(|grants| {
                grants
                    .iter()
                    .filter(|g| {
                        g.academy_id.is_none() || g.academy_id.as_ref() == Some(academy_id)
                    })
                    .map(|g| g.permission.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Additive department override for `(academy, department)`, if any.
    pub fn department_additions(
        &self,
        academy_id: &AcademyId,
        department_id: &DepartmentId,
    ) -> Option<&PermissionSet> {
        self.department_overrides
            .get(&(academy_id.clone(), department_id.clone()))
    }

    /// Rebuild this snapshot with one more grant. System roles accept new
    /// grants; only role removal is restricted.
    pub fn with_grant(
        &self,
        role_id: RoleId,
        permission: Permission,
        academy_id: Option<AcademyId>,
    ) -> Self {
        let mut next = self.clone();
        let grants = next.grants.entry(role_id).or_default();
        let grant = RoleGrant {
            permission,
            academy_id,
        };
        if !grants.contains(&grant) {
            grants.push(grant);
        }
        next
    }

    /// Rebuild this snapshot without a grant.
    pub fn without_grant(
        &self,
        role_id: &RoleId,
        permission: &Permission,
        academy_id: Option<&AcademyId>,
    ) -> Self {
        let mut next = self.clone();
        if let Some(grants) = next.grants.get_mut(role_id) {
            grants.retain(|g| {
                !(g.permission == *permission && g.academy_id.as_ref() == academy_id)
            });
        }
        next
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Builder for catalog snapshots.
#[derive(Debug, Default)]
pub struct RoleCatalogBuilder {
    catalog: RoleCatalog,
}

impl RoleCatalogBuilder {
    pub fn role(mut self, role: Role) -> Self {
        self.catalog.roles.insert(role.id.clone(), role);
        self
    }

    /// Grant a permission globally (in every academy).
    pub fn grant_global(mut self, role_id: impl Into<RoleId>, permission: Permission) -> Self {
        self.catalog
            .grants
            .entry(role_id.into())
            .or_default()
            .push(RoleGrant {
                permission,
                academy_id: None,
            });
        self
    }

    /// Grant a permission scoped to one academy.
    pub fn grant_scoped(
        mut self,
        role_id: impl Into<RoleId>,
        academy_id: impl Into<AcademyId>,
        permission: Permission,
    ) -> Self {
        self.catalog
            .grants
            .entry(role_id.into())
            .or_default()
            .push(RoleGrant {
                permission,
                academy_id: Some(academy_id.into()),
            });
        self
    }

    /// Add an additive department override.
    pub fn department_override(
        mut self,
        academy_id: impl Into<AcademyId>,
        department_id: impl Into<DepartmentId>,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Self {
        self.catalog
            .department_overrides
            .entry((academy_id.into(), department_id.into()))
            .or_default()
            .extend(permissions);
        self
    }

    pub fn build(self) -> RoleCatalog {
        self.catalog
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Seed Roles
// ═══════════════════════════════════════════════════════════════════════════════

/// The platform's seed roles.
///
/// | Role | Description |
/// |------|-------------|
/// | `admin` | Full academy management |
/// | `instructor` | Creates and manages content, grades submissions |
/// | `teaching_assistant` | Reads content, grades submissions |
/// | `student` | Reads content, submits work |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedRole {
    Admin,
    Instructor,
    TeachingAssistant,
    Student,
}

impl SeedRole {
    pub fn id(&self) -> RoleId {
        RoleId::new(match self {
            Self::Admin => "admin",
            Self::Instructor => "instructor",
            Self::TeachingAssistant => "teaching_assistant",
            Self::Student => "student",
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Admin => "Admin",
            Self::Instructor => "Instructor",
            Self::TeachingAssistant => "Teaching Assistant",
            Self::Student => "Student",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Self::Admin => "Full academy management",
            Self::Instructor => "Creates and manages content, grades submissions",
            Self::TeachingAssistant => "Reads content, grades submissions",
            Self::Student => "Reads content, submits work",
        }
    }

    fn permission_names(&self) -> &'static [&'static str] {
        match self {
            Self::Admin => &[
                "academy.manage",
                "member.manage",
                "content.create",
                "content.update",
                "content.delete",
                "content.read",
                "submission.grade",
                "report.read",
            ],
            Self::Instructor => &[
                "content.create",
                "content.update",
                "content.read",
                "submission.grade",
                "report.read",
            ],
            Self::TeachingAssistant => &["content.read", "submission.grade"],
            Self::Student => &["content.read", "submission.create"],
        }
    }

    pub fn to_role(&self) -> Role {
        Role::new(self.id(), self.name())
            .with_description(self.description())
            .system()
    }

    pub fn all() -> &'static [SeedRole] {
        &[
            Self::Admin,
            Self::Instructor,
            Self::TeachingAssistant,
            Self::Student,
        ]
    }
}

impl RoleCatalog {
    /// A catalog pre-populated with the seed roles and their global grants.
    pub fn with_seed_roles() -> Self {
        let mut builder = Self::builder();
        for seed in SeedRole::all() {
            builder = builder.role(seed.to_role());
            for name in seed.permission_names() {
                // Seed names are compile-time constants in canonical form.
                if let Ok(permission) = Permission::parse(name) {
                    builder = builder.grant_global(seed.id(), permission);
                }
            }
        }
        builder.build()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
