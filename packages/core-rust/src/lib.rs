//! `fnstate` Core: store keys, operation kinds, errors, and the counter codec
//! shared by the client pipeline and every backend connector.

pub mod counter;
pub mod error;
pub mod key;
pub mod operation;

pub use counter::{decode_counter, encode_counter, merge_counter, COUNTER_SIZE};
pub use error::{ErrorKind, Outcome, StateError};
pub use key::{validate_key, StoreKey, MAX_KEY_SIZE};
pub use operation::{OpId, OperationKind};
