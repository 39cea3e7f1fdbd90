//! Catalog-path resolution.
//!
//! A catalog path is an ordered list of ancestor entities where index 0 is
//! the catalog and subsequent entries descend towards the parent of the
//! entity being addressed. Resolution re-looks-up each ancestor by id and
//! revalidates its `entity_version` against the caller-supplied one (when
//! non-zero), which gives serializable-style reads inside a transaction:
//! if any ancestor was concurrently dropped or changed, the path no longer
//! resolves.

use strata_core::Diagnostics;

use crate::entity::{EntityCore, EntityType, NULL_ID, ROOT_ENTITY_ID};
use crate::persistence::TransactionSlices;

/// The `(catalog_id, parent_id)` pair a catalog path reduces to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Id of the catalog, or [`NULL_ID`] for top-level entities.
    pub catalog_id_or_null: i64,
    /// Id of the direct parent (the root container for top-level
    /// entities).
    pub parent_id: i64,
}

impl ResolvedPath {
    /// The resolution of the empty path: top-level under the root
    /// container.
    #[must_use]
    pub const fn top_level() -> Self {
        Self {
            catalog_id_or_null: NULL_ID,
            parent_id: ROOT_ENTITY_ID,
        }
    }

    /// Reduces a path to `(catalog_id, parent_id)` without revalidating
    /// ancestors. Used by the atomic strategy, which trades the
    /// concurrently-deleted-ancestor check for one-shot operation.
    #[must_use]
    pub fn unchecked(path: &[EntityCore]) -> Self {
        match (path.first(), path.last()) {
            (Some(first), Some(last)) => Self {
                catalog_id_or_null: first.id,
                parent_id: last.id,
            },
            _ => Self::top_level(),
        }
    }
}

/// A catalog path that failed to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolutionError {
    /// Which ancestor failed and why.
    pub detail: String,
}

/// Resolves a catalog path against the store, revalidating each ancestor.
///
/// # Errors
///
/// Returns [`PathResolutionError`] when any ancestor is missing or its
/// version moved from the caller-supplied one.
pub fn resolve_catalog_path(
    view: &dyn TransactionSlices,
    diagnostics: &Diagnostics,
    path: &[EntityCore],
) -> Result<ResolvedPath, PathResolutionError> {
    let Some(first) = path.first() else {
        return Ok(ResolvedPath::top_level());
    };
    diagnostics.check(
        first.entity_type == EntityType::Catalog,
        "catalog_path_must_start_with_catalog",
    );

    for ancestor in path {
        let Some(stored) = view.lookup_entity(ancestor.catalog_id, ancestor.id, ancestor.entity_type)
        else {
            return Err(PathResolutionError {
                detail: format!(
                    "ancestor '{}' (id {}) no longer exists",
                    ancestor.name, ancestor.id
                ),
            });
        };
        if ancestor.entity_version != 0 && stored.entity_version != ancestor.entity_version {
            return Err(PathResolutionError {
                detail: format!(
                    "ancestor '{}' (id {}) changed version {} -> {}",
                    ancestor.name, ancestor.id, ancestor.entity_version, stored.entity_version
                ),
            });
        }
    }

    let last = path.last().unwrap_or(first);
    Ok(ResolvedPath {
        catalog_id_or_null: first.id,
        parent_id: last.id,
    })
}
