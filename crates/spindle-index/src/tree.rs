//! Ordered index over a B-tree map.
//!
//! Non-unique trees tiebreak equal keys on the full field vector, so
//! iteration order is deterministic and a (key, tuple) pair addresses
//! exactly one entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use spindle_error::{Result, SpindleError};
use spindle_types::{KeyDef, TupleRef, Value};

use crate::{check_dup, cmp_prefix, DupMode, Index, IndexStats, IteratorType};

/// (extracted key, tiebreak). The tiebreak is empty for unique trees
/// and the full field vector for non-unique ones.
type OrdKey = (Vec<Value>, Vec<Value>);

pub struct TreeIndex {
    key_def: KeyDef,
    map: BTreeMap<OrdKey, TupleRef>,
    stats: IndexStats,
}

impl TreeIndex {
    pub fn new(key_def: KeyDef) -> Self {
        Self {
            key_def,
            map: BTreeMap::new(),
            stats: IndexStats::default(),
        }
    }

    fn ord_key(&self, tuple: &TupleRef) -> Result<OrdKey> {
        let key = self.key_def.extract_key(tuple.fields())?;
        let tie = if self.key_def.unique {
            Vec::new()
        } else {
            tuple.fields().to_vec()
        };
        Ok((key, tie))
    }
}

impl Index for TreeIndex {
    fn key_def(&self) -> &KeyDef {
        &self.key_def
    }

    fn set_key_def(&mut self, key_def: KeyDef) {
        debug_assert!(self.key_def.same_parts(&key_def));
        self.key_def = key_def;
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn get(&self, key: &[Value]) -> Result<Option<TupleRef>> {
        self.key_def.validate_key(key)?;
        if self.key_def.unique && key.len() == self.key_def.parts.len() {
            return Ok(self.map.get(&(key.to_vec(), Vec::new())).cloned());
        }
        Ok(self
            .map
            .iter()
            .find(|((k, _), _)| cmp_prefix(k, key).is_eq())
            .map(|(_, t)| Arc::clone(t)))
    }

    fn replace(
        &mut self,
        old: Option<&TupleRef>,
        new: Option<&TupleRef>,
        mode: DupMode,
    ) -> Result<Option<TupleRef>> {
        match (old, new) {
            (old, Some(new)) => {
                let new_key = self.ord_key(new)?;
                if self.key_def.unique {
                    let dup = self.map.get(&new_key).cloned();
                    check_dup(old, dup.as_ref(), mode, &self.key_def)?;
                    if dup.is_none() {
                        if let Some(old_tuple) = old {
                            let old_key = self.ord_key(old_tuple)?;
                            self.map.remove(&old_key);
                        }
                    }
                    self.map.insert(new_key, Arc::clone(new));
                    self.stats.inserts += 1;
                    Ok(dup.or_else(|| old.cloned()))
                } else {
                    if let Some(old_tuple) = old {
                        let old_key = self.ord_key(old_tuple)?;
                        self.map.remove(&old_key);
                    }
                    self.map.insert(new_key, Arc::clone(new));
                    self.stats.inserts += 1;
                    Ok(old.cloned())
                }
            }
            (Some(old_tuple), None) => {
                let old_key = self.ord_key(old_tuple)?;
                Ok(self.map.remove(&old_key))
            }
            (None, None) => Err(SpindleError::illegal_params(
                "replace with neither an old nor a new tuple",
            )),
        }
    }

    fn iterate(&self, ty: IteratorType, key: &[Value]) -> Result<Vec<TupleRef>> {
        self.key_def.validate_key(key)?;
        use std::cmp::Ordering::{Greater, Less};
        let out = match ty {
            IteratorType::All => self.map.values().cloned().collect(),
            IteratorType::Eq => self
                .map
                .iter()
                .filter(|((k, _), _)| cmp_prefix(k, key).is_eq())
                .map(|(_, t)| Arc::clone(t))
                .collect(),
            IteratorType::Ge => self
                .map
                .iter()
                .filter(|((k, _), _)| cmp_prefix(k, key) != Less)
                .map(|(_, t)| Arc::clone(t))
                .collect(),
            IteratorType::Gt => self
                .map
                .iter()
                .filter(|((k, _), _)| cmp_prefix(k, key) == Greater)
                .map(|(_, t)| Arc::clone(t))
                .collect(),
            IteratorType::Le => self
                .map
                .iter()
                .rev()
                .filter(|((k, _), _)| cmp_prefix(k, key) != Greater)
                .map(|(_, t)| Arc::clone(t))
                .collect(),
            IteratorType::Lt => self
                .map
                .iter()
                .rev()
                .filter(|((k, _), _)| cmp_prefix(k, key) == Less)
                .map(|(_, t)| Arc::clone(t))
                .collect(),
        };
        Ok(out)
    }

    fn begin_build(&mut self) {}

    fn build_next(&mut self, tuple: &TupleRef) -> Result<()> {
        let key = self.ord_key(tuple)?;
        self.map.insert(key, Arc::clone(tuple));
        self.stats.builds += 1;
        Ok(())
    }

    fn end_build(&mut self) {}

    fn read_view(&self) -> Vec<TupleRef> {
        self.map.values().cloned().collect()
    }

    fn stats(&self) -> IndexStats {
        self.stats
    }
}
