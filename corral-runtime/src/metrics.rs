//! Process-wide runtime metrics
//!
//! Counters live in the prometheus default registry, keyed by controller
//! name (or resource type for the cache gauge); exposition transport is
//! the embedder's concern. Tests read them back through the same statics.

use prometheus::{
    register_counter_vec, register_int_counter_vec, register_int_gauge_vec, CounterVec,
    IntCounterVec, IntGaugeVec,
};
use std::sync::LazyLock;

/// Restarts of full-reconcile controllers after error or panic.
pub static CONTROLLER_CRASHES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "controller_crashes",
        "number of controller crashes and panics",
        &["controller"]
    )
    .expect("controller_crashes registered twice")
});

/// Wake signals delivered to full-reconcile controllers.
pub static CONTROLLER_WAKEUPS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "controller_wakeups",
        "number of controller wakeups",
        &["controller"]
    )
    .expect("controller_wakeups registered twice")
});

/// Reads performed through controller state adapters.
pub static CONTROLLER_READS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "controller_reads",
        "number of controller state reads",
        &["controller"]
    )
    .expect("controller_reads registered twice")
});

/// Writes performed through controller state adapters.
pub static CONTROLLER_WRITES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "controller_writes",
        "number of controller state writes",
        &["controller"]
    )
    .expect("controller_writes registered twice")
});

/// Failed reconcile or map attempts of queued controllers.
pub static QCONTROLLER_CRASHES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "qcontroller_crashes",
        "number of queued-controller crashes and panics",
        &["controller"]
    )
    .expect("qcontroller_crashes registered twice")
});

/// Requeues requested by queued controllers.
pub static QCONTROLLER_REQUEUES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "qcontroller_requeues",
        "number of queued-controller requeues",
        &["controller"]
    )
    .expect("qcontroller_requeues registered twice")
});

/// Successfully processed reconcile items.
pub static QCONTROLLER_PROCESSED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "qcontroller_processed",
        "number of queued-controller items processed",
        &["controller"]
    )
    .expect("qcontroller_processed registered twice")
});

/// Map jobs consumed from secondary inputs.
pub static QCONTROLLER_MAPPED_IN: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "qcontroller_mapped_in",
        "number of secondary-input events mapped",
        &["controller"]
    )
    .expect("qcontroller_mapped_in registered twice")
});

/// Primary items produced by map jobs.
pub static QCONTROLLER_MAPPED_OUT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "qcontroller_mapped_out",
        "number of primary items produced by mapping",
        &["controller"]
    )
    .expect("qcontroller_mapped_out registered twice")
});

/// Outstanding items in queued-controller queues.
pub static QCONTROLLER_QUEUE_LENGTH: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "qcontroller_queue_length",
        "outstanding items in the reconcile queue",
        &["controller"]
    )
    .expect("qcontroller_queue_length registered twice")
});

/// Seconds spent in map jobs.
pub static QCONTROLLER_MAP_BUSY: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        "qcontroller_map_busy",
        "seconds spent mapping secondary inputs",
        &["controller"]
    )
    .expect("qcontroller_map_busy registered twice")
});

/// Seconds spent in reconcile jobs.
pub static QCONTROLLER_RECONCILE_BUSY: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        "qcontroller_reconcile_busy",
        "seconds spent reconciling items",
        &["controller"]
    )
    .expect("qcontroller_reconcile_busy registered twice")
});

/// Resources held by the read-through cache, per type.
pub static CACHED_RESOURCES: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "cached_resources",
        "resources held by the read-through cache",
        &["type"]
    )
    .expect("cached_resources registered twice")
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_readable_by_label() {
        CONTROLLER_CRASHES.with_label_values(&["metrics-test"]).inc();
        CONTROLLER_CRASHES.with_label_values(&["metrics-test"]).inc();
        assert_eq!(
            CONTROLLER_CRASHES.with_label_values(&["metrics-test"]).get(),
            2
        );
        QCONTROLLER_QUEUE_LENGTH
            .with_label_values(&["metrics-test"])
            .set(3);
        assert_eq!(
            QCONTROLLER_QUEUE_LENGTH
                .with_label_values(&["metrics-test"])
                .get(),
            3
        );
    }
}
