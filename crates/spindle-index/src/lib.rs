//! Index abstraction for the memtx engine.
//!
//! All four access methods implement one [`Index`] trait with a uniform
//! `replace(old, new, mode)` mutation primitive. The duplicate-handling
//! contract lives in [`check_dup`] and is shared by every unique index:
//!
//! - [`DupMode::Insert`]: fail if the new key collides with any tuple.
//! - [`DupMode::Replace`]: require that the new key matches an existing
//!   tuple; in a secondary index the match must be the very tuple the
//!   primary key replaced, otherwise the statement is inconsistent.
//! - [`DupMode::ReplaceOrInsert`]: `Replace` when the key matches,
//!   `Insert` otherwise.
//!
//! The concrete data structures here are deliberately plain ordered and
//! hashed maps; the engine depends only on the contract.

mod hash;
mod multi;
mod tree;

use spindle_error::{Result, SpindleError};
use spindle_types::{IndexType, KeyDef, TupleRef, Value};

pub use hash::HashIndex;
pub use multi::{BitsetIndex, RtreeIndex};
pub use tree::TreeIndex;

/// Duplicate-handling mode of a `replace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupMode {
    Insert,
    Replace,
    ReplaceOrInsert,
}

/// Mutation counters of one index. A rebuild shows up here; an alter
/// that merely moves an index (a rename) does not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Tuples inserted through dup-checked `replace`.
    pub inserts: u64,
    /// Tuples appended through bulk build.
    pub builds: u64,
}

impl IndexStats {
    pub const fn total(self) -> u64 {
        self.inserts + self.builds
    }
}

/// Iterator direction/filter for range scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorType {
    All,
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
}

impl IteratorType {
    /// Decode the numeric wire form used in select requests.
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(Self::All),
            1 => Ok(Self::Eq),
            2 => Ok(Self::Ge),
            3 => Ok(Self::Gt),
            4 => Ok(Self::Le),
            5 => Ok(Self::Lt),
            other => Err(SpindleError::illegal_params(format!(
                "invalid iterator type {other}"
            ))),
        }
    }
}

/// One access path over a space.
pub trait Index: Send {
    fn key_def(&self) -> &KeyDef;

    /// Swap in a new definition with identical parts. This is how a
    /// cosmetic index change (a rename) lands without a rebuild.
    fn set_key_def(&mut self, key_def: KeyDef);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point lookup by full key. On a non-unique index returns the
    /// first match in index order.
    fn get(&self, key: &[Value]) -> Result<Option<TupleRef>>;

    /// The unified mutation primitive. See the module docs for the
    /// mode contract. Returns the tuple that was removed, if any.
    fn replace(
        &mut self,
        old: Option<&TupleRef>,
        new: Option<&TupleRef>,
        mode: DupMode,
    ) -> Result<Option<TupleRef>>;

    /// Range scan. `key` may be a prefix of the key definition.
    fn iterate(&self, ty: IteratorType, key: &[Value]) -> Result<Vec<TupleRef>>;

    /// Enter bulk-build mode: subsequent [`Index::build_next`] calls
    /// append without duplicate checks.
    fn begin_build(&mut self);

    /// Append a tuple during bulk build.
    fn build_next(&mut self, tuple: &TupleRef) -> Result<()>;

    /// Finish bulk build.
    fn end_build(&mut self);

    /// A stable snapshot of the index contents in index order. The
    /// returned handles keep every tuple alive for as long as the view
    /// exists, which lets a checkpoint cord stream it while the live
    /// index keeps changing.
    fn read_view(&self) -> Vec<TupleRef>;

    /// Lifetime mutation counters.
    fn stats(&self) -> IndexStats;
}

/// Shared duplicate check for unique indexes.
///
/// `old` is the tuple the statement expects to displace (the primary
/// key's match, if any); `dup` is what this index actually found under
/// the new tuple's key.
pub fn check_dup(
    old: Option<&TupleRef>,
    dup: Option<&TupleRef>,
    mode: DupMode,
    key_def: &KeyDef,
) -> Result<()> {
    match dup {
        None => {
            if mode == DupMode::Replace {
                return Err(SpindleError::TupleNotFound {
                    index: key_def.iid,
                    space: key_def.space_id.to_string(),
                });
            }
        }
        Some(dup) => {
            let same_as_old = old.is_some_and(|o| std::sync::Arc::ptr_eq(o, dup));
            if !same_as_old && (old.is_some() || mode == DupMode::Insert) {
                return Err(SpindleError::TupleFound {
                    index: key_def.iid,
                    space: key_def.space_id.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Create the index implementation matching the key definition's type.
pub fn create_index(key_def: &KeyDef) -> Box<dyn Index> {
    match key_def.index_type {
        IndexType::Hash => Box::new(HashIndex::new(key_def.clone())),
        IndexType::Tree => Box::new(TreeIndex::new(key_def.clone())),
        IndexType::Rtree => Box::new(RtreeIndex::new(key_def.clone())),
        IndexType::Bitset => Box::new(BitsetIndex::new(key_def.clone())),
    }
}

/// Compare a full key against a (possibly partial) search key: only the
/// parts present in `prefix` participate.
pub(crate) fn cmp_prefix(full: &[Value], prefix: &[Value]) -> std::cmp::Ordering {
    for (a, b) in full.iter().zip(prefix.iter()) {
        let ord = a.cmp(b);
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use spindle_types::{FieldType, KeyPart, Tuple, TupleFormat};

    fn tree_def(unique: bool) -> KeyDef {
        KeyDef::new(
            512,
            0,
            "primary",
            IndexType::Tree,
            unique,
            vec![KeyPart {
                field_no: 0,
                field_type: FieldType::Unsigned,
            }],
        )
        .unwrap()
    }

    fn tuple(fields: Vec<Value>) -> TupleRef {
        Tuple::from_values(&Arc::new(TupleFormat::default()), fields).unwrap()
    }

    #[test]
    fn insert_then_get() {
        let mut index = TreeIndex::new(tree_def(true));
        let t = tuple(vec![Value::Unsigned(1), Value::Str("a".into())]);
        let old = index.replace(None, Some(&t), DupMode::Insert).unwrap();
        assert!(old.is_none());
        let found = index.get(&[Value::Unsigned(1)]).unwrap().unwrap();
        assert_eq!(*found, *t);
    }

    #[test]
    fn dup_insert_fails_on_collision() {
        let mut index = TreeIndex::new(tree_def(true));
        let a = tuple(vec![Value::Unsigned(1), Value::Str("a".into())]);
        let b = tuple(vec![Value::Unsigned(1), Value::Str("b".into())]);
        index.replace(None, Some(&a), DupMode::Insert).unwrap();
        let err = index.replace(None, Some(&b), DupMode::Insert).unwrap_err();
        assert!(matches!(err, SpindleError::TupleFound { .. }));
        // The failed insert must not have mutated the index.
        assert_eq!(index.len(), 1);
        assert_eq!(*index.get(&[Value::Unsigned(1)]).unwrap().unwrap(), *a);
    }

    #[test]
    fn dup_replace_requires_a_match() {
        let mut index = TreeIndex::new(tree_def(true));
        let a = tuple(vec![Value::Unsigned(1)]);
        let err = index.replace(None, Some(&a), DupMode::Replace).unwrap_err();
        assert!(matches!(err, SpindleError::TupleNotFound { .. }));
        assert!(index.is_empty());
    }

    #[test]
    fn dup_replace_or_insert_covers_both() {
        let mut index = TreeIndex::new(tree_def(true));
        let a = tuple(vec![Value::Unsigned(1), Value::Str("a".into())]);
        let b = tuple(vec![Value::Unsigned(1), Value::Str("b".into())]);
        assert!(index
            .replace(None, Some(&a), DupMode::ReplaceOrInsert)
            .unwrap()
            .is_none());
        let displaced = index
            .replace(None, Some(&b), DupMode::ReplaceOrInsert)
            .unwrap()
            .unwrap();
        assert_eq!(*displaced, *a);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn delete_returns_the_old_tuple() {
        let mut index = TreeIndex::new(tree_def(true));
        let a = tuple(vec![Value::Unsigned(7)]);
        index.replace(None, Some(&a), DupMode::Insert).unwrap();
        let removed = index
            .replace(Some(&a), None, DupMode::ReplaceOrInsert)
            .unwrap()
            .unwrap();
        assert_eq!(*removed, *a);
        assert!(index.is_empty());
    }

    #[test]
    fn secondary_same_tuple_rule() {
        // A unique secondary sees replace(old, new, Insert): if the key
        // is occupied by a different tuple than `old`, that's an error.
        let def = KeyDef::new(
            512,
            1,
            "sk",
            IndexType::Tree,
            true,
            vec![KeyPart {
                field_no: 1,
                field_type: FieldType::Str,
            }],
        )
        .unwrap();
        let mut index = TreeIndex::new(def);
        let a = tuple(vec![Value::Unsigned(1), Value::Str("same".into())]);
        let b = tuple(vec![Value::Unsigned(2), Value::Str("same".into())]);
        index.replace(None, Some(&a), DupMode::Insert).unwrap();
        let err = index
            .replace(Some(&b), Some(&b), DupMode::Insert)
            .unwrap_err();
        assert!(matches!(err, SpindleError::TupleFound { .. }));
        // Replacing tuple `a` itself under the same key is fine.
        let c = tuple(vec![Value::Unsigned(1), Value::Str("same".into())]);
        index.replace(Some(&a), Some(&c), DupMode::Insert).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn tree_iterates_in_key_order() {
        let mut index = TreeIndex::new(tree_def(true));
        for v in [3u64, 1, 2] {
            let t = tuple(vec![Value::Unsigned(v)]);
            index.replace(None, Some(&t), DupMode::Insert).unwrap();
        }
        let keys: Vec<u64> = index
            .iterate(IteratorType::All, &[])
            .unwrap()
            .iter()
            .map(|t| t.field(0).unwrap().as_unsigned().unwrap())
            .collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn tree_range_iterators() {
        let mut index = TreeIndex::new(tree_def(true));
        for v in 1u64..=5 {
            let t = tuple(vec![Value::Unsigned(v)]);
            index.replace(None, Some(&t), DupMode::Insert).unwrap();
        }
        let collect = |ty| -> Vec<u64> {
            index
                .iterate(ty, &[Value::Unsigned(3)])
                .unwrap()
                .iter()
                .map(|t| t.field(0).unwrap().as_unsigned().unwrap())
                .collect()
        };
        assert_eq!(collect(IteratorType::Eq), vec![3]);
        assert_eq!(collect(IteratorType::Ge), vec![3, 4, 5]);
        assert_eq!(collect(IteratorType::Gt), vec![4, 5]);
        assert_eq!(collect(IteratorType::Le), vec![3, 2, 1]);
        assert_eq!(collect(IteratorType::Lt), vec![2, 1]);
    }

    #[test]
    fn non_unique_tree_holds_duplicate_keys() {
        let def = KeyDef::new(
            512,
            1,
            "by_name",
            IndexType::Tree,
            false,
            vec![KeyPart {
                field_no: 1,
                field_type: FieldType::Str,
            }],
        )
        .unwrap();
        let mut index = TreeIndex::new(def);
        let a = tuple(vec![Value::Unsigned(1), Value::Str("x".into())]);
        let b = tuple(vec![Value::Unsigned(2), Value::Str("x".into())]);
        index.replace(None, Some(&a), DupMode::Insert).unwrap();
        index.replace(None, Some(&b), DupMode::Insert).unwrap();
        assert_eq!(index.len(), 2);
        let matches = index
            .iterate(IteratorType::Eq, &[Value::Str("x".into())])
            .unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn hash_index_supports_point_lookups_only() {
        let def = KeyDef::new(
            512,
            0,
            "primary",
            IndexType::Hash,
            true,
            vec![KeyPart {
                field_no: 0,
                field_type: FieldType::Unsigned,
            }],
        )
        .unwrap();
        let mut index = HashIndex::new(def);
        let t = tuple(vec![Value::Unsigned(9)]);
        index.replace(None, Some(&t), DupMode::Insert).unwrap();
        assert_eq!(
            index
                .iterate(IteratorType::Eq, &[Value::Unsigned(9)])
                .unwrap()
                .len(),
            1
        );
        assert_eq!(index.iterate(IteratorType::All, &[]).unwrap().len(), 1);
        assert!(index.iterate(IteratorType::Ge, &[Value::Unsigned(1)]).is_err());
    }

    #[test]
    fn read_view_is_stable_under_mutation() {
        let mut index = TreeIndex::new(tree_def(true));
        let a = tuple(vec![Value::Unsigned(1)]);
        index.replace(None, Some(&a), DupMode::Insert).unwrap();
        let view = index.read_view();
        let b = tuple(vec![Value::Unsigned(2)]);
        index.replace(None, Some(&b), DupMode::Insert).unwrap();
        index
            .replace(Some(&a), None, DupMode::ReplaceOrInsert)
            .unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].field(0).unwrap().as_unsigned(), Some(1));
    }

    #[test]
    fn bulk_build_skips_dup_checks() {
        let mut index = TreeIndex::new(tree_def(true));
        index.begin_build();
        for v in [1u64, 2, 3] {
            index
                .build_next(&tuple(vec![Value::Unsigned(v)]))
                .unwrap();
        }
        index.end_build();
        assert_eq!(index.len(), 3);
        assert_eq!(index.stats(), IndexStats { inserts: 0, builds: 3 });
    }
}
