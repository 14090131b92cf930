/// Boltzmann constant in meV / K
pub const BOLTZMANN_IN_MEV_K: f64 = 8.617_333_262e-2;

/// Default per-axis tolerance used when matching repeat measurements
pub const DEFAULT_MERGE_TOLERANCE: f64 = 5.0e-4;
