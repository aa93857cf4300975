// Customer and price lookups
pub mod catalog;

// Stock movements and daily snapshots
pub mod inventory_ledger;

// Order lifecycle
pub mod orders;
pub mod sequence;

// Deferred application sweep
pub mod reconciliation;
