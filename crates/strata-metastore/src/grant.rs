//! Grant records: privileges held by grantees over securables.
//!
//! A grantee (principal, principal role or catalog role) holds a privilege
//! over a securable (any entity except tasks). Creating or deleting a
//! grant record bumps `grant_records_version` on BOTH endpoints so cached
//! authorisation state can be invalidated with a single version check.

use serde::{Deserialize, Serialize};

use crate::entity::{EntityCore, EntityId};

/// A privilege grantable on a securable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Privilege {
    /// Administer top-level access on the root container.
    ServiceManageAccess,
    /// Administer grants within a catalog.
    CatalogManageAccess,
    /// Administer metadata (namespaces, tables, views) within a catalog.
    CatalogManageMetadata,
    /// Use a catalog role (granted to principal roles).
    CatalogRoleUsage,
    /// Use a principal role (granted to principals).
    PrincipalRoleUsage,
    /// Read catalog properties.
    CatalogReadProperties,
    /// Write catalog properties.
    CatalogWriteProperties,
    /// Create namespaces.
    NamespaceCreate,
    /// Drop namespaces.
    NamespaceDrop,
    /// Create tables.
    TableCreate,
    /// Drop tables.
    TableDrop,
    /// Read table data.
    TableReadData,
    /// Write table data.
    TableWriteData,
    /// Create views.
    ViewCreate,
    /// Drop views.
    ViewDrop,
}

impl Privilege {
    /// Stable numeric code used in persisted grant records.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::ServiceManageAccess => 1,
            Self::CatalogManageAccess => 2,
            Self::CatalogManageMetadata => 3,
            Self::CatalogRoleUsage => 4,
            Self::PrincipalRoleUsage => 5,
            Self::CatalogReadProperties => 6,
            Self::CatalogWriteProperties => 7,
            Self::NamespaceCreate => 8,
            Self::NamespaceDrop => 9,
            Self::TableCreate => 10,
            Self::TableDrop => 11,
            Self::TableReadData => 12,
            Self::TableWriteData => 13,
            Self::ViewCreate => 14,
            Self::ViewDrop => 15,
        }
    }
}

/// A persisted grant record.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct GrantRecord {
    /// Catalog id of the securable endpoint.
    pub securable_catalog_id: i64,
    /// Entity id of the securable endpoint.
    pub securable_id: i64,
    /// Catalog id of the grantee endpoint.
    pub grantee_catalog_id: i64,
    /// Entity id of the grantee endpoint.
    pub grantee_id: i64,
    /// The granted privilege.
    pub privilege: Privilege,
}

impl GrantRecord {
    /// Creates a grant of `privilege` on `securable` to `grantee`.
    #[must_use]
    pub fn new(securable: &EntityCore, grantee: &EntityCore, privilege: Privilege) -> Self {
        Self {
            securable_catalog_id: securable.catalog_id,
            securable_id: securable.id,
            grantee_catalog_id: grantee.catalog_id,
            grantee_id: grantee.id,
            privilege,
        }
    }

    /// Identity pair of the securable endpoint.
    #[must_use]
    pub const fn securable_entity_id(&self) -> EntityId {
        EntityId::new(self.securable_catalog_id, self.securable_id)
    }

    /// Identity pair of the grantee endpoint.
    #[must_use]
    pub const fn grantee_entity_id(&self) -> EntityId {
        EntityId::new(self.grantee_catalog_id, self.grantee_id)
    }
}
