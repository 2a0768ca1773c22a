//! Fixed mapping and validation rules from the source record shape to the
//! destination record shape.

mod transform;
mod validate;

pub use transform::{map_execution_status, Transformer};
pub use validate::{validate, DESTINATION_STATUSES, MAX_ATTACHMENT_SIZE, MAX_NAME_LEN};
