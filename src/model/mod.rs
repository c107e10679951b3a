//! The data model shared across every component (spec §3):
//! `ObjectDescriptor`, `FieldDescriptor`, `ComplexField`, `Task`,
//! `EnginePlan`.

mod complex_field;
mod object;
mod task;

pub use complex_field::{ComplexField, ComplexFieldError, CompositeExternalId};
pub use object::{FieldDescriptor, FieldType, ObjectDescriptor, ObjectTable, Operation};
pub use task::{EnginePlan, Record, RecordAction, Task};
