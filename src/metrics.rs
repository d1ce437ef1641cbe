use std::sync::LazyLock;

use prometheus::{
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry, IntCounterVec,
    IntGaugeVec, Registry,
};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static DEVICE_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "fwban_device_requests_total",
        "Outgoing RouterOS API requests",
        &["host", "op"],
        &REGISTRY
    )
    .unwrap()
});

pub static DEVICE_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "fwban_device_errors_total",
        "Steady-state remote failures, per device",
        &["device"],
        &REGISTRY
    )
    .unwrap()
});

pub static DYNAMIC_BANS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec_with_registry!(
        "fwban_dynamic_bans",
        "Dynamic banlist entries currently mirrored on the device",
        &["device"],
        &REGISTRY
    )
    .unwrap()
});
