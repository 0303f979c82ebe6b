//! Core business logic - framework-agnostic ledger operations.

/// Per-student balance cache derived from the ledger
pub mod balance;
/// Recording payments and their invoices
pub mod collection;
/// Opening-balance CSV import
pub mod import;
/// Month-scoped invoice numbering
pub mod invoice;
/// Monthly ledger record generation and cascade
pub mod ledger;
/// First-of-month trigger
pub mod monthly;
/// Calendar month value type
pub mod period;
/// History and yearly rollups
pub mod report;
/// Fee group resolution
pub mod tuition_group;
