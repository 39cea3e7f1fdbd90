//! Metastore metrics.
//!
//! Counters for entity writes, optimistic-concurrency conflicts and task
//! leasing. These complement the structured logging already in place.

use metrics::{counter, describe_counter};

/// Entity writes applied (creates and updates).
pub const ENTITY_WRITES: &str = "strata_metastore_entity_writes_total";

/// Compare-and-swap conflicts observed on entity writes.
pub const WRITE_CONFLICTS: &str = "strata_metastore_write_conflicts_total";

/// Tasks leased to executors.
pub const TASKS_LEASED: &str = "strata_metastore_tasks_leased_total";

/// Registers metric descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(ENTITY_WRITES, "Entity writes applied (creates and updates)");
    describe_counter!(
        WRITE_CONFLICTS,
        "Compare-and-swap conflicts observed on entity writes"
    );
    describe_counter!(TASKS_LEASED, "Tasks leased to executors");
}

pub(crate) fn record_entity_write() {
    counter!(ENTITY_WRITES).increment(1);
}

pub(crate) fn record_write_conflict() {
    counter!(WRITE_CONFLICTS).increment(1);
}

pub(crate) fn record_tasks_leased(count: usize) {
    counter!(TASKS_LEASED).increment(count as u64);
}
