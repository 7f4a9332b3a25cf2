pub mod balances;
pub mod internal_transactions;
pub mod token_balances;
pub mod token_metadata;

/// How many rounds an entry that keeps drawing unclassified node errors
/// is retried before the batch gives up on it. Transport failures are not
/// counted against this; they retry for as long as it takes.
pub(crate) const UNCLASSIFIED_RETRY_LIMIT: u32 = 3;
