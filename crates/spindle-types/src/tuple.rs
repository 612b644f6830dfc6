//! Reference-counted tuples and tuple formats.
//!
//! A [`Tuple`] is immutable after creation and shared by reference
//! count: every index that holds it, and every read-view iterator that
//! streams it, owns one `Arc` clone. The tuple is freed when the last
//! holder releases it, which is what lets checkpoint read views outlive
//! in-memory deletions without a delayed-free protocol.

use std::sync::Arc;

use spindle_error::{Result, SpindleError};
use uuid::Uuid;

use crate::codec::{decode_tuple, encode_tuple};
use crate::key_def::KeyDef;
use crate::value::{FieldType, Value};

/// Shared handle to an immutable tuple.
pub type TupleRef = Arc<Tuple>;

/// Shape constraints for tuples of one space: the exact field count
/// (0 = unchecked) and per-field type constraints collected from the
/// space's key definitions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TupleFormat {
    exact_field_count: u32,
    field_types: Vec<FieldType>,
}

impl TupleFormat {
    /// Build a format from the space's field count and its key list.
    ///
    /// Every indexed field becomes required; its type constraint is the
    /// strictest one any key part places on it.
    pub fn new(exact_field_count: u32, keys: &[&KeyDef]) -> Result<Self> {
        let mut field_types: Vec<FieldType> = Vec::new();
        for key in keys {
            for part in &key.parts {
                let no = part.field_no as usize;
                if field_types.len() <= no {
                    field_types.resize(no + 1, FieldType::Any);
                }
                let slot = &mut field_types[no];
                if *slot == FieldType::Any {
                    *slot = part.field_type;
                } else if part.field_type != FieldType::Any && *slot != part.field_type {
                    return Err(SpindleError::modify_index(
                        &key.name,
                        key.space_id.to_string(),
                        format!(
                            "field {no} is indexed both as {} and as {}",
                            slot.as_str(),
                            part.field_type.as_str()
                        ),
                    ));
                }
            }
        }
        if exact_field_count != 0 && (field_types.len() as u32) > exact_field_count {
            return Err(SpindleError::illegal_params(format!(
                "space field count {exact_field_count} is smaller than the highest indexed field"
            )));
        }
        Ok(Self {
            exact_field_count,
            field_types,
        })
    }

    pub const fn exact_field_count(&self) -> u32 {
        self.exact_field_count
    }

    /// Check a decoded field vector against this format.
    pub fn validate(&self, fields: &[Value]) -> Result<()> {
        if self.exact_field_count != 0 && fields.len() as u32 != self.exact_field_count {
            return Err(SpindleError::ExactFieldCount {
                expected: self.exact_field_count,
                actual: fields.len() as u32,
            });
        }
        for (no, constraint) in self.field_types.iter().enumerate() {
            let field = fields.get(no).ok_or_else(|| {
                SpindleError::illegal_params(format!(
                    "tuple is missing indexed field {no}"
                ))
            })?;
            if !constraint.admits(field) {
                return Err(SpindleError::KeyFieldType {
                    field_no: no as u32,
                    expected: constraint.as_str(),
                    actual: field.type_name(),
                });
            }
        }
        Ok(())
    }
}

/// An immutable record: the wire image plus the decoded field vector.
#[derive(Debug)]
pub struct Tuple {
    format: Arc<TupleFormat>,
    data: Box<[u8]>,
    fields: Vec<Value>,
}

impl Tuple {
    /// Decode a wire-format byte slice and validate it against `format`.
    pub fn new(format: &Arc<TupleFormat>, data: &[u8]) -> Result<TupleRef> {
        let fields = decode_tuple(data)?;
        format.validate(&fields)?;
        Ok(Arc::new(Self {
            format: Arc::clone(format),
            data: data.into(),
            fields,
        }))
    }

    /// Build a tuple from already-decoded fields.
    pub fn from_values(format: &Arc<TupleFormat>, fields: Vec<Value>) -> Result<TupleRef> {
        format.validate(&fields)?;
        let data = encode_tuple(&fields).into_boxed_slice();
        Ok(Arc::new(Self {
            format: Arc::clone(format),
            data,
            fields,
        }))
    }

    /// Re-validate an existing tuple against another format. Used when a
    /// tuple built for one space is inserted into an altered copy.
    pub fn check_format(&self, format: &TupleFormat) -> Result<()> {
        format.validate(&self.fields)
    }

    pub fn format(&self) -> &Arc<TupleFormat> {
        &self.format
    }

    /// The wire image.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    pub fn field_count(&self) -> u32 {
        self.fields.len() as u32
    }

    pub fn field(&self, no: u32) -> Option<&Value> {
        self.fields.get(no as usize)
    }

    fn required_field(&self, no: u32) -> Result<&Value> {
        self.field(no).ok_or_else(|| {
            SpindleError::illegal_params(format!("tuple has no field {no}"))
        })
    }

    /// Fetch field `no` as an unsigned integer that fits in 32 bits.
    pub fn field_u32(&self, no: u32) -> Result<u32> {
        let field = self.required_field(no)?;
        let v = field.as_unsigned().ok_or(SpindleError::KeyFieldType {
            field_no: no,
            expected: FieldType::Unsigned.as_str(),
            actual: field.type_name(),
        })?;
        u32::try_from(v).map_err(|_| {
            SpindleError::illegal_params(format!("field {no} value {v} does not fit in u32"))
        })
    }

    /// Fetch field `no` as a string slice.
    pub fn field_str(&self, no: u32) -> Result<&str> {
        let field = self.required_field(no)?;
        field.as_str().ok_or(SpindleError::KeyFieldType {
            field_no: no,
            expected: FieldType::Str.as_str(),
            actual: field.type_name(),
        })
    }

    /// Fetch field `no` as a UUID parsed from its string form.
    pub fn field_uuid(&self, no: u32) -> Result<Uuid> {
        let s = self.field_str(no)?;
        Uuid::parse_str(s).map_err(|_| SpindleError::InvalidUuid {
            value: s.to_owned(),
        })
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl Eq for Tuple {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_def::{IndexType, KeyPart};

    fn format_for(parts: &[(u32, FieldType)]) -> Arc<TupleFormat> {
        let parts = parts
            .iter()
            .map(|&(field_no, field_type)| KeyPart {
                field_no,
                field_type,
            })
            .collect();
        let key = KeyDef::new(512, 0, "primary", IndexType::Tree, true, parts).unwrap();
        Arc::new(TupleFormat::new(0, &[&key]).unwrap())
    }

    #[test]
    fn wire_round_trip_through_tuple() {
        let format = format_for(&[(0, FieldType::Unsigned)]);
        let t = Tuple::from_values(&format, vec![Value::Unsigned(1), Value::Str("a".into())])
            .unwrap();
        let again = Tuple::new(&format, t.data()).unwrap();
        assert_eq!(*t, *again);
    }

    #[test]
    fn format_rejects_missing_indexed_field() {
        let format = format_for(&[(2, FieldType::Unsigned)]);
        let err = Tuple::from_values(&format, vec![Value::Unsigned(1)]).unwrap_err();
        assert!(err.to_string().contains("missing indexed field 2"));
    }

    #[test]
    fn format_rejects_wrong_type() {
        let format = format_for(&[(1, FieldType::Unsigned)]);
        assert!(Tuple::from_values(
            &format,
            vec![Value::Unsigned(1), Value::Str("not a number".into())]
        )
        .is_err());
    }

    #[test]
    fn exact_field_count_enforced() {
        let key = KeyDef::new(
            512,
            0,
            "primary",
            IndexType::Tree,
            true,
            vec![KeyPart {
                field_no: 0,
                field_type: FieldType::Unsigned,
            }],
        )
        .unwrap();
        let format = Arc::new(TupleFormat::new(2, &[&key]).unwrap());
        assert!(Tuple::from_values(&format, vec![Value::Unsigned(1)]).is_err());
        assert!(
            Tuple::from_values(&format, vec![Value::Unsigned(1), Value::Str("x".into())])
                .is_ok()
        );
    }

    #[test]
    fn conflicting_part_types_rejected() {
        let a = KeyDef::new(
            512,
            0,
            "primary",
            IndexType::Tree,
            true,
            vec![KeyPart {
                field_no: 0,
                field_type: FieldType::Unsigned,
            }],
        )
        .unwrap();
        let b = KeyDef::new(
            512,
            1,
            "sk",
            IndexType::Tree,
            true,
            vec![KeyPart {
                field_no: 0,
                field_type: FieldType::Str,
            }],
        )
        .unwrap();
        assert!(TupleFormat::new(0, &[&a, &b]).is_err());
    }

    #[test]
    fn typed_accessors() {
        let format = Arc::new(TupleFormat::default());
        let uuid = Uuid::new_v4();
        let t = Tuple::from_values(
            &format,
            vec![
                Value::Unsigned(280),
                Value::Str(uuid.to_string()),
            ],
        )
        .unwrap();
        assert_eq!(t.field_u32(0).unwrap(), 280);
        assert_eq!(t.field_uuid(1).unwrap(), uuid);
        assert!(t.field_u32(1).is_err());
        assert!(t.field_str(5).is_err());
    }
}
