//! Retry policy and the carrier error taxonomy.

pub mod error;
pub mod policy;

pub use error::{classify_message, ErrorKind, QuoteError};
pub use policy::{AttemptRecord, RetryOutcome, RetryPolicy};
