//! A small metrics registry plus `inc!`/`record!` macros, modeled on the
//! teacher's `iroh_metrics` core/collector split. Recording against an
//! uninstalled registry is a silent no-op, so `bitswap-core`'s unit tests
//! never need to set one up.

mod core;
#[cfg(feature = "bitswap")]
pub mod bitswap;

pub use crate::core::{install, is_installed, MetricsCore};

#[cfg(feature = "bitswap")]
pub use crate::bitswap::BitswapMetrics;

/// Increments a counter on whichever collector is currently installed,
/// e.g. `bitswap_metrics::inc!(BitswapMetrics::MessagesSent)`.
#[macro_export]
macro_rules! inc {
    ($collector:ty::$metric:ident) => {
        $crate::core::with_global::<$collector, _>(|c| {
            <$collector as $crate::core::Collector>::inc(c, <$collector>::$metric)
        });
    };
}

/// Records a value on a gauge/histogram-style metric, e.g.
/// `bitswap_metrics::record!(BitswapMetrics::QueueDepth, len as f64)`.
#[macro_export]
macro_rules! record {
    ($collector:ty::$metric:ident, $value:expr) => {
        $crate::core::with_global::<$collector, _>(|c| {
            <$collector as $crate::core::Collector>::record(c, <$collector>::$metric, $value)
        });
    };
}
