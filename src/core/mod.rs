pub mod error;
pub mod types;

pub use error::{BoxError, Result, TxError};
pub use types::{OwnerToken, StageId};
