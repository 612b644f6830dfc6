//! Single-part non-unique access methods.
//!
//! RTREE and BITSET indexes are non-unique maps over one field (an
//! ARRAY for RTREE, an UNSIGNED or STR for BITSET). Both reuse the
//! ordered multimap machinery of [`TreeIndex`] and restrict the
//! iterator surface to ALL and EQ; spatial and bit-mask query shapes
//! are the concern of the specialized data structures this engine
//! treats as replaceable.

use spindle_error::{Result, SpindleError};
use spindle_types::{KeyDef, TupleRef, Value};

use crate::tree::TreeIndex;
use crate::{DupMode, Index, IndexStats, IteratorType};

macro_rules! multimap_index {
    ($name:ident, $label:literal) => {
        pub struct $name {
            inner: TreeIndex,
        }

        impl $name {
            pub fn new(key_def: KeyDef) -> Self {
                Self {
                    inner: TreeIndex::new(key_def),
                }
            }
        }

        impl Index for $name {
            fn key_def(&self) -> &KeyDef {
                self.inner.key_def()
            }

            fn set_key_def(&mut self, key_def: KeyDef) {
                self.inner.set_key_def(key_def);
            }

            fn len(&self) -> usize {
                self.inner.len()
            }

            fn get(&self, key: &[Value]) -> Result<Option<TupleRef>> {
                self.inner.get(key)
            }

            fn replace(
                &mut self,
                old: Option<&TupleRef>,
                new: Option<&TupleRef>,
                mode: DupMode,
            ) -> Result<Option<TupleRef>> {
                self.inner.replace(old, new, mode)
            }

            fn iterate(&self, ty: IteratorType, key: &[Value]) -> Result<Vec<TupleRef>> {
                match ty {
                    IteratorType::All | IteratorType::Eq => self.inner.iterate(ty, key),
                    _ => Err(SpindleError::illegal_params(concat!(
                        $label,
                        " index supports ALL and EQ iterators"
                    ))),
                }
            }

            fn begin_build(&mut self) {
                self.inner.begin_build();
            }

            fn build_next(&mut self, tuple: &TupleRef) -> Result<()> {
                self.inner.build_next(tuple)
            }

            fn end_build(&mut self) {
                self.inner.end_build();
            }

            fn read_view(&self) -> Vec<TupleRef> {
                self.inner.read_view()
            }

            fn stats(&self) -> IndexStats {
                self.inner.stats()
            }
        }
    };
}

multimap_index!(RtreeIndex, "RTREE");
multimap_index!(BitsetIndex, "BITSET");
