//! Explicit result partitions returned by bulk registry operations.
//!
//! Bulk operations never abort wholesale on one unit's failure; instead
//! every outcome lands in one of these partitions, with per-unit failures
//! collected as [`UnitError`]s alongside the success sets.

use crate::error::UnitError;

/// Outcome of [`Registry::load_all`](crate::Registry::load_all).
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Units loaded, in load order.
    pub loaded: Vec<String>,
    pub errors: Vec<UnitError>,
}

/// Outcome of [`Registry::unload_all`](crate::Registry::unload_all).
#[derive(Debug, Default)]
pub struct UnloadReport {
    /// Units unloaded, in unload order (dependents first).
    pub unloaded: Vec<String>,
    pub errors: Vec<UnitError>,
}

/// Outcome of a single-unit [`Registry::recompile`](crate::Registry::recompile).
#[derive(Debug, Default)]
pub struct RecompileReport {
    /// Units whose fresh binaries were swapped in, in compile order.
    pub compiled: Vec<String>,
    /// Units unloaded for the swap, dependents first.
    pub unloaded: Vec<String>,
    /// Units loaded afterwards, dependencies first.
    pub loaded: Vec<String>,
    pub errors: Vec<UnitError>,
}

/// Outcome of [`Registry::recompile_all`](crate::Registry::recompile_all).
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Units newly discovered in the root directory.
    pub added: Vec<String>,
    /// Units whose source tree vanished; no longer registered.
    pub removed: Vec<String>,
    pub compiled: Vec<String>,
    pub unloaded: Vec<String>,
    pub loaded: Vec<String>,
    pub errors: Vec<UnitError>,
}
