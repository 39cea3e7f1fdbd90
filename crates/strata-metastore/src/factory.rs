//! Per-realm manager factory.
//!
//! Each realm owns an isolated store and manager. The in-memory factory
//! creates both on first access and bootstraps the realm exactly once per
//! process; bootstrap itself is idempotent, so a lost race between two
//! first accesses is harmless.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

use strata_core::{CallContext, RealmId};

use crate::entity::{EntitySubType, EntityType, CLIENT_ID_PROPERTY, ROOT_PRINCIPAL_NAME};
use crate::manager::atomic::AtomicMetastore;
use crate::manager::{MetastoreManager, OpResult};
use crate::persistence::memory::InMemoryStore;

/// Factory handing out one bootstrapped in-memory manager per realm.
#[derive(Default)]
pub struct InMemoryMetastoreFactory {
    managers: Mutex<HashMap<RealmId, Arc<AtomicMetastore<InMemoryStore>>>>,
}

impl InMemoryMetastoreFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the realm's manager, creating and bootstrapping it on
    /// first access.
    ///
    /// # Errors
    ///
    /// Propagates bootstrap failures.
    pub async fn get_or_create(
        &self,
        ctx: &CallContext,
    ) -> OpResult<Arc<AtomicMetastore<InMemoryStore>>> {
        if let Some(existing) = self.lookup(ctx.realm()) {
            return Ok(existing);
        }

        let manager = Arc::new(AtomicMetastore::new(Arc::new(InMemoryStore::new())));
        manager.bootstrap_service(ctx).await?;

        // Surface where the realm's root credentials live. The client id
        // is not a secret; the secret itself is only handed out by
        // rotation.
        if let Ok(root_principal) = manager
            .read_entity_by_name(
                ctx,
                &[],
                EntityType::Principal,
                EntitySubType::Any,
                ROOT_PRINCIPAL_NAME,
            )
            .await
        {
            info!(
                realm = %ctx.realm(),
                client_id = root_principal.internal_property(CLIENT_ID_PROPERTY).unwrap_or(""),
                "bootstrapped realm"
            );
        }

        let mut managers = self
            .managers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(Arc::clone(
            managers
                .entry(ctx.realm().clone())
                .or_insert(manager),
        ))
    }

    fn lookup(&self, realm: &RealmId) -> Option<Arc<AtomicMetastore<InMemoryStore>>> {
        self.managers
            .lock()
            .ok()
            .and_then(|managers| managers.get(realm).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{NULL_ID, ROOT_ENTITY_ID};

    #[tokio::test]
    async fn first_access_bootstraps_the_realm() {
        let factory = InMemoryMetastoreFactory::new();
        let ctx = CallContext::new(RealmId::new_unchecked("acme-prod"));

        let manager = factory.get_or_create(&ctx).await.unwrap();
        let root = manager
            .load_entity(&ctx, NULL_ID, ROOT_ENTITY_ID, EntityType::Root)
            .await
            .unwrap();
        assert_eq!(root.id, ROOT_ENTITY_ID);
    }

    #[tokio::test]
    async fn realms_are_isolated() {
        let factory = InMemoryMetastoreFactory::new();
        let ctx_a = CallContext::new(RealmId::new_unchecked("realm-a"));
        let ctx_b = CallContext::new(RealmId::new_unchecked("realm-b"));

        let manager_a = factory.get_or_create(&ctx_a).await.unwrap();
        let manager_b = factory.get_or_create(&ctx_b).await.unwrap();
        assert!(!Arc::ptr_eq(&manager_a, &manager_b));

        // The same realm gets the same manager back.
        let again = factory.get_or_create(&ctx_a).await.unwrap();
        assert!(Arc::ptr_eq(&manager_a, &again));
    }
}
