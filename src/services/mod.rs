//! Ready made service and DID jobs

mod multiple_read_data_by_identifier;
mod read_identifier;

pub use multiple_read_data_by_identifier::*;
pub use read_identifier::*;
