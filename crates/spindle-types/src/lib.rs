pub mod codec;
pub mod key_def;
pub mod tuple;
pub mod value;

pub use key_def::{IndexType, KeyDef, KeyPart, INDEX_MAX, PART_MAX};
pub use tuple::{Tuple, TupleFormat, TupleRef};
pub use value::{FieldType, Value};
