//! Entity module - Contains all SeaORM entity definitions for the database.
//! These entities represent the database tables the ledger engine reads and writes.
//! Each entity has a Model struct for data and an Entity struct for operations.

pub mod invoice;
pub mod invoice_counter;
pub mod ledger_record;
pub mod opening_balance;
pub mod student;
pub mod student_balance;
pub mod system_state;
pub mod transaction;
pub mod tuition_group;

// Re-export specific types to avoid conflicts
pub use invoice::{Column as InvoiceColumn, Entity as Invoice, Model as InvoiceModel};
pub use invoice_counter::{
    Column as InvoiceCounterColumn, Entity as InvoiceCounter, Model as InvoiceCounterModel,
};
pub use ledger_record::{
    Column as LedgerRecordColumn, Entity as LedgerRecord, Model as LedgerRecordModel,
};
pub use opening_balance::{
    Column as OpeningBalanceColumn, Entity as OpeningBalance, Model as OpeningBalanceModel,
};
pub use student::{Column as StudentColumn, Entity as Student, Model as StudentModel};
pub use student_balance::{
    Column as StudentBalanceColumn, Entity as StudentBalance, Model as StudentBalanceModel,
};
pub use system_state::{
    Column as SystemStateColumn, Entity as SystemState, Model as SystemStateModel,
};
pub use transaction::{
    Column as TransactionColumn, Entity as Transaction, Model as TransactionModel,
};
pub use tuition_group::{
    Column as TuitionGroupColumn, Entity as TuitionGroup, Model as TuitionGroupModel,
};
