//! Source-ledger state model
//!
//! The engine keeps no durable state. Pending records and balances live on
//! the source ledger; these types mirror its accounts, and
//! `MemorySourceLedger` applies the same rules in-process.

mod memory;
mod records;

pub use memory::{LedgerCall, MemorySourceLedger};
pub use records::{
    Identity, InitiateDeposit, InitiateWithdraw, PendingDepositRecord, PendingWithdrawalRecord,
    UserBalanceRecord,
};
