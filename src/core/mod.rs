pub mod error;

pub use error::{Result, Retryable, StoreError, TallyError};
