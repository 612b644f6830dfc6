//! Index key definitions.

use std::fmt;

use spindle_error::{Result, SpindleError};

use crate::value::{FieldType, Value};

/// Highest index id allowed in a space (`iid` 0 is the primary key).
pub const INDEX_MAX: u32 = 10;

/// Maximum number of parts in one key definition.
pub const PART_MAX: u32 = 255;

/// Access method of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    Hash,
    Tree,
    Rtree,
    Bitset,
}

impl IndexType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hash => "HASH",
            Self::Tree => "TREE",
            Self::Rtree => "RTREE",
            Self::Bitset => "BITSET",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "HASH" => Ok(Self::Hash),
            "TREE" => Ok(Self::Tree),
            "RTREE" => Ok(Self::Rtree),
            "BITSET" => Ok(Self::Bitset),
            _ => Err(SpindleError::illegal_params(format!(
                "unknown index type '{name}'"
            ))),
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One part of a key: which field, and what type it must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPart {
    pub field_no: u32,
    pub field_type: FieldType,
}

/// Definition of one index over a space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDef {
    pub space_id: u32,
    pub iid: u32,
    pub name: String,
    pub index_type: IndexType,
    pub unique: bool,
    pub parts: Vec<KeyPart>,
}

impl KeyDef {
    /// Create a key definition, applying the engine-independent checks:
    /// index id range, part count bounds. Engine-specific constraints
    /// (HASH uniqueness and friends) are the storage engine's business.
    pub fn new(
        space_id: u32,
        iid: u32,
        name: impl Into<String>,
        index_type: IndexType,
        unique: bool,
        parts: Vec<KeyPart>,
    ) -> Result<Self> {
        let name = name.into();
        if iid > INDEX_MAX {
            return Err(SpindleError::modify_index(
                &name,
                space_id.to_string(),
                format!("index id {iid} is too big (max {INDEX_MAX})"),
            ));
        }
        if parts.is_empty() {
            return Err(SpindleError::modify_index(
                &name,
                space_id.to_string(),
                "part count must be positive",
            ));
        }
        if parts.len() > PART_MAX as usize {
            return Err(SpindleError::modify_index(
                &name,
                space_id.to_string(),
                format!("too many key parts (max {PART_MAX})"),
            ));
        }
        Ok(Self {
            space_id,
            iid,
            name,
            index_type,
            unique,
            parts,
        })
    }

    pub fn part_count(&self) -> u32 {
        self.parts.len() as u32
    }

    pub const fn is_primary(&self) -> bool {
        self.iid == 0
    }

    /// Extract this key from a decoded field vector.
    pub fn extract_key(&self, fields: &[Value]) -> Result<Vec<Value>> {
        let mut key = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            let field = fields.get(part.field_no as usize).ok_or_else(|| {
                SpindleError::illegal_params(format!(
                    "tuple has no field {} required by index '{}'",
                    part.field_no, self.name
                ))
            })?;
            if !part.field_type.admits(field) {
                return Err(SpindleError::KeyFieldType {
                    field_no: part.field_no,
                    expected: part.field_type.as_str(),
                    actual: field.type_name(),
                });
            }
            key.push(field.clone());
        }
        Ok(key)
    }

    /// Validate a search key against this definition: no more parts than
    /// the index has, each of the right type.
    pub fn validate_key(&self, key: &[Value]) -> Result<()> {
        if key.len() > self.parts.len() {
            return Err(SpindleError::KeyPartCount {
                expected: self.part_count(),
                actual: key.len() as u32,
            });
        }
        for (part, value) in self.parts.iter().zip(key) {
            if !part.field_type.admits(value) {
                return Err(SpindleError::KeyFieldType {
                    field_no: part.field_no,
                    expected: part.field_type.as_str(),
                    actual: value.type_name(),
                });
            }
        }
        Ok(())
    }

    /// Whether two definitions index the same data the same way: type,
    /// uniqueness and part lists all match. Cosmetic attributes (name)
    /// are ignored. This is the alter planner's merge criterion.
    pub fn same_parts(&self, other: &Self) -> bool {
        self.index_type == other.index_type
            && self.unique == other.unique
            && self.parts == other.parts
    }

    /// Full structural equality, including the cosmetic attributes.
    pub fn same_def(&self, other: &Self) -> bool {
        self.iid == other.iid && self.name == other.name && self.same_parts(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(parts: Vec<KeyPart>) -> KeyDef {
        KeyDef::new(512, 0, "primary", IndexType::Tree, true, parts).unwrap()
    }

    #[test]
    fn rejects_empty_parts() {
        assert!(KeyDef::new(512, 0, "pk", IndexType::Tree, true, vec![]).is_err());
    }

    #[test]
    fn rejects_large_iid() {
        let parts = vec![KeyPart {
            field_no: 0,
            field_type: FieldType::Unsigned,
        }];
        assert!(KeyDef::new(512, INDEX_MAX + 1, "x", IndexType::Tree, true, parts).is_err());
    }

    #[test]
    fn extract_key_picks_parts_in_order() {
        let d = def(vec![
            KeyPart {
                field_no: 1,
                field_type: FieldType::Str,
            },
            KeyPart {
                field_no: 0,
                field_type: FieldType::Unsigned,
            },
        ]);
        let fields = vec![Value::Unsigned(7), Value::Str("k".into())];
        let key = d.extract_key(&fields).unwrap();
        assert_eq!(key, vec![Value::Str("k".into()), Value::Unsigned(7)]);
    }

    #[test]
    fn extract_key_missing_field() {
        let d = def(vec![KeyPart {
            field_no: 3,
            field_type: FieldType::Unsigned,
        }]);
        assert!(d.extract_key(&[Value::Unsigned(1)]).is_err());
    }

    #[test]
    fn extract_key_type_mismatch() {
        let d = def(vec![KeyPart {
            field_no: 0,
            field_type: FieldType::Unsigned,
        }]);
        let err = d.extract_key(&[Value::Str("oops".into())]).unwrap_err();
        assert!(matches!(
            err,
            spindle_error::SpindleError::KeyFieldType { field_no: 0, .. }
        ));
    }

    #[test]
    fn validate_key_part_count() {
        let d = def(vec![KeyPart {
            field_no: 0,
            field_type: FieldType::Unsigned,
        }]);
        assert!(d.validate_key(&[]).is_ok());
        assert!(d.validate_key(&[Value::Unsigned(1)]).is_ok());
        assert!(d
            .validate_key(&[Value::Unsigned(1), Value::Unsigned(2)])
            .is_err());
    }

    #[test]
    fn same_parts_ignores_name() {
        let a = def(vec![KeyPart {
            field_no: 0,
            field_type: FieldType::Unsigned,
        }]);
        let mut b = a.clone();
        b.name = "renamed".into();
        assert!(a.same_parts(&b));
        assert!(!a.same_def(&b));
        b.unique = false;
        assert!(!a.same_parts(&b));
    }
}
