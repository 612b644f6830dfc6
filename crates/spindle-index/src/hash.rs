//! Hashed point-lookup index. Always unique; supports only ALL and EQ
//! iterators.

use std::collections::HashMap;
use std::sync::Arc;

use spindle_error::{Result, SpindleError};
use spindle_types::{KeyDef, TupleRef, Value};

use crate::{check_dup, DupMode, Index, IndexStats, IteratorType};

pub struct HashIndex {
    key_def: KeyDef,
    map: HashMap<Vec<Value>, TupleRef>,
    stats: IndexStats,
}

impl HashIndex {
    pub fn new(key_def: KeyDef) -> Self {
        Self {
            key_def,
            map: HashMap::new(),
            stats: IndexStats::default(),
        }
    }

    fn full_key(&self, key: &[Value]) -> Result<()> {
        if key.len() != self.key_def.parts.len() {
            return Err(SpindleError::KeyPartCount {
                expected: self.key_def.part_count(),
                actual: key.len() as u32,
            });
        }
        Ok(())
    }
}

impl Index for HashIndex {
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
        self.full_key(key)?;
        Ok(self.map.get(key).cloned())
    }

    fn replace(
        &mut self,
        old: Option<&TupleRef>,
        new: Option<&TupleRef>,
        mode: DupMode,
    ) -> Result<Option<TupleRef>> {
        match (old, new) {
            (old, Some(new)) => {
                let new_key = self.key_def.extract_key(new.fields())?;
                let dup = self.map.get(&new_key).cloned();
                check_dup(old, dup.as_ref(), mode, &self.key_def)?;
                if dup.is_none() {
                    if let Some(old_tuple) = old {
                        let old_key = self.key_def.extract_key(old_tuple.fields())?;
                        self.map.remove(&old_key);
                    }
                }
                self.map.insert(new_key, Arc::clone(new));
                self.stats.inserts += 1;
                Ok(dup.or_else(|| old.cloned()))
            }
            (Some(old_tuple), None) => {
                let old_key = self.key_def.extract_key(old_tuple.fields())?;
                Ok(self.map.remove(&old_key))
            }
            (None, None) => Err(SpindleError::illegal_params(
                "replace with neither an old nor a new tuple",
            )),
        }
    }

    fn iterate(&self, ty: IteratorType, key: &[Value]) -> Result<Vec<TupleRef>> {
        match ty {
            IteratorType::All => Ok(self.map.values().cloned().collect()),
            IteratorType::Eq => Ok(self.get(key)?.into_iter().collect()),
            _ => Err(SpindleError::illegal_params(
                "HASH index supports ALL and EQ iterators",
            )),
        }
    }

    fn begin_build(&mut self) {}

    fn build_next(&mut self, tuple: &TupleRef) -> Result<()> {
        let key = self.key_def.extract_key(tuple.fields())?;
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
