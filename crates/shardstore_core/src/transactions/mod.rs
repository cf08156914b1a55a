//! Per-channel transactions log.
//!
//! Every physical change to a channel's data files is recorded here. At
//! startup the log is replayed ([`TransactionsAnalysis`]) to learn the
//! valid length of every file; anything beyond is the remainder of an
//! interrupted write and is cut off.

pub mod analysis;
pub mod cleaner;
pub mod entry;
pub mod log;

pub use analysis::{LoggedFile, TransactionsAnalysis};
pub use entry::{EntryIter, TransactionEntry};
pub use log::TransactionsLog;
