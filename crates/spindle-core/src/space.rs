//! Spaces: named ordered collections of tuples with one or more access
//! paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use spindle_error::{Result, SpindleError};
use spindle_index::Index;
use spindle_types::{KeyDef, TupleFormat, TupleRef};
use tracing::warn;

use crate::memtx::{self, ReplaceFn};
use crate::schema::{SC_SYSTEM_ID_MAX, SC_SYSTEM_ID_MIN};

/// Shared handle to one index. Sharing is what makes the alter
/// planner's commit cheap: moving an index between the old and the new
/// space is a handle swap, not a rebuild.
pub type IndexRef = Arc<Mutex<Box<dyn Index>>>;

/// Which system-space trigger observes mutations of a space, if any.
pub fn is_system_space(id: u32) -> bool {
    (SC_SYSTEM_ID_MIN..SC_SYSTEM_ID_MAX).contains(&id)
}

/// Static attributes of a space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceDef {
    pub id: u32,
    /// Owner uid.
    pub uid: u32,
    pub name: String,
    pub engine: String,
    /// Exact tuple field count; 0 disables the check.
    pub field_count: u32,
    pub temporary: bool,
}

impl SpaceDef {
    /// Parse the `flags` field of a `_space` tuple: a comma-separated
    /// list; `temporary` is the only recognized flag.
    fn parse_flags(flags: &str) -> bool {
        flags
            .split(',')
            .any(|flag| flag.trim().eq_ignore_ascii_case("temporary"))
    }

    /// Build a definition from a `_space` tuple:
    /// `(id, uid, name, engine, field_count, flags?)`.
    ///
    /// `is_create` selects the error context and enables the
    /// reserved-band warning, which only makes sense for new spaces.
    pub fn from_tuple(tuple: &TupleRef, is_create: bool) -> Result<Self> {
        let id = tuple.field_u32(0)?;
        let uid = tuple.field_u32(1)?;
        let name = tuple.field_str(2)?.to_owned();
        let engine = tuple.field_str(3)?.to_owned();
        let field_count = tuple.field_u32(4)?;
        let temporary = match tuple.field(5) {
            Some(flags) => {
                let flags = flags.as_str().ok_or_else(|| {
                    SpindleError::illegal_params("space flags must be a string")
                })?;
                Self::parse_flags(flags)
            }
            None => false,
        };
        if name.is_empty() {
            return Err(if is_create {
                SpindleError::CreateSpace {
                    name,
                    detail: "space name is empty".to_owned(),
                }
            } else {
                SpindleError::alter_space(id, "space name is empty")
            });
        }
        if engine != "memtx" {
            return Err(SpindleError::CreateSpace {
                name,
                detail: format!("unknown engine '{engine}'"),
            });
        }
        if is_create && is_system_space(id) {
            warn!(
                space_id = id,
                reserved_min = SC_SYSTEM_ID_MIN,
                reserved_max = SC_SYSTEM_ID_MAX,
                "creating a space with a reserved id; ids in this range may be \
                 used for a system space in the future"
            );
        }
        Ok(Self {
            id,
            uid,
            name,
            engine,
            field_count,
            temporary,
        })
    }
}

/// A trigger kept on a space while an index build is in flight: every
/// replace in the space is mirrored into the index under construction.
pub struct BuildSyncTrigger {
    pub id: u64,
    pub new_index: IndexRef,
}

/// A space: definition, format, ordered index list, access map, and the
/// engine's per-space replace dispatch state.
pub struct Space {
    pub def: SpaceDef,
    pub format: Arc<TupleFormat>,
    indexes: Vec<IndexRef>,
    index_map: HashMap<u32, usize>,
    /// Engine dispatch: which replace implementation statements go
    /// through, per the space's recovery phase.
    pub replace_fn: ReplaceFn,
    /// Per-user access bits granted on this space.
    pub access: BTreeMap<u32, u8>,
    /// In-flight index-build synchronization triggers.
    pub on_replace: Vec<BuildSyncTrigger>,
    next_trigger_id: u64,
    /// Set while an alter plan is staged against this space; a second
    /// concurrent alter is refused. Under the single-cord model this is
    /// a forward-compatibility hook, not a lock.
    pub being_altered: bool,
}

impl Space {
    /// Create a space from a definition and a key list. The indexes are
    /// created empty; the caller decides the replace dispatch.
    pub fn new(def: SpaceDef, key_list: &[KeyDef]) -> Result<Self> {
        let mut keys: Vec<&KeyDef> = key_list.iter().collect();
        keys.sort_by_key(|k| k.iid);
        for key in &keys {
            memtx::key_def_check(&def.name, key)?;
        }
        let format = Arc::new(TupleFormat::new(def.field_count, &keys)?);
        let mut indexes = Vec::with_capacity(keys.len());
        let mut index_map = HashMap::new();
        for key in keys {
            index_map.insert(key.iid, indexes.len());
            indexes.push(Arc::new(Mutex::new(spindle_index::create_index(key))));
        }
        Ok(Self {
            def,
            format,
            indexes,
            index_map,
            replace_fn: ReplaceFn::NoKeys,
            access: BTreeMap::new(),
            on_replace: Vec::new(),
            next_trigger_id: 0,
            being_altered: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.def.id
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn is_system(&self) -> bool {
        is_system_space(self.def.id)
    }

    pub fn index_count(&self) -> usize {
        self.indexes.len()
    }

    /// The index with the given iid.
    pub fn index(&self, iid: u32) -> Result<IndexRef> {
        self.index_map
            .get(&iid)
            .map(|&pos| Arc::clone(&self.indexes[pos]))
            .ok_or_else(|| SpindleError::NoSuchIndex {
                index: iid,
                space: self.def.name.clone(),
            })
    }

    pub fn index_opt(&self, iid: u32) -> Option<IndexRef> {
        self.index_map
            .get(&iid)
            .map(|&pos| Arc::clone(&self.indexes[pos]))
    }

    pub fn primary_key(&self) -> Result<IndexRef> {
        self.index(0).map_err(|_| SpindleError::NoSuchIndex {
            index: 0,
            space: self.def.name.clone(),
        })
    }

    /// All indexes in iid order.
    pub fn indexes(&self) -> &[IndexRef] {
        &self.indexes
    }

    /// Replace the handle in the slot holding `iid`.
    pub fn set_index(&mut self, iid: u32, index: IndexRef) {
        let pos = self.index_map[&iid];
        self.indexes[pos] = index;
    }

    /// Number of tuples, as reported by the primary key.
    pub fn size(&self) -> usize {
        self.index_opt(0).map_or(0, |pk| pk.lock().len())
    }

    /// Clone the key definitions in iid order, the starting point of
    /// an alter plan.
    pub fn dump_def(&self) -> Vec<KeyDef> {
        self.indexes
            .iter()
            .map(|index| index.lock().key_def().clone())
            .collect()
    }

    /// Recompute the iid → slot map after the alter planner has moved
    /// indexes around.
    pub fn rebuild_index_map(&mut self) {
        self.indexes.sort_by_key(|index| index.lock().key_def().iid);
        self.index_map = self
            .indexes
            .iter()
            .enumerate()
            .map(|(pos, index)| (index.lock().key_def().iid, pos))
            .collect();
    }

    /// Install a build-synchronization trigger; returns its id.
    pub fn add_build_sync(&mut self, new_index: IndexRef) -> u64 {
        self.next_trigger_id += 1;
        let id = self.next_trigger_id;
        self.on_replace.push(BuildSyncTrigger { id, new_index });
        id
    }

    /// Remove a build-synchronization trigger by id, wherever the alter
    /// outcome left it.
    pub fn remove_build_sync(&mut self, id: u64) {
        self.on_replace.retain(|t| t.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_types::{FieldType, IndexType, KeyPart, Value};

    fn def(id: u32) -> SpaceDef {
        SpaceDef {
            id,
            uid: 1,
            name: "items".to_owned(),
            engine: "memtx".to_owned(),
            field_count: 0,
            temporary: false,
        }
    }

    fn pk_def(space_id: u32) -> KeyDef {
        KeyDef::new(
            space_id,
            0,
            "primary",
            IndexType::Tree,
            true,
            vec![KeyPart {
                field_no: 0,
                field_type: FieldType::Unsigned,
            }],
        )
        .unwrap()
    }

    #[test]
    fn space_def_flags_parsing() {
        assert!(SpaceDef::parse_flags("temporary"));
        assert!(SpaceDef::parse_flags("foo, temporary"));
        assert!(SpaceDef::parse_flags("TEMPORARY"));
        assert!(!SpaceDef::parse_flags("permanent"));
        assert!(!SpaceDef::parse_flags(""));
    }

    #[test]
    fn space_def_from_tuple() {
        let format = Arc::new(spindle_types::TupleFormat::default());
        let t = spindle_types::Tuple::from_values(
            &format,
            vec![
                Value::Unsigned(512),
                Value::Unsigned(1),
                Value::Str("t".into()),
                Value::Str("memtx".into()),
                Value::Unsigned(0),
                Value::Str("temporary".into()),
            ],
        )
        .unwrap();
        let def = SpaceDef::from_tuple(&t, true).unwrap();
        assert_eq!(def.id, 512);
        assert!(def.temporary);

        let bad_engine = spindle_types::Tuple::from_values(
            &format,
            vec![
                Value::Unsigned(512),
                Value::Unsigned(1),
                Value::Str("t".into()),
                Value::Str("sophia".into()),
                Value::Unsigned(0),
            ],
        )
        .unwrap();
        assert!(SpaceDef::from_tuple(&bad_engine, true).is_err());
    }

    #[test]
    fn indexes_are_ordered_by_iid() {
        let sk = KeyDef::new(
            512,
            1,
            "sk",
            IndexType::Tree,
            false,
            vec![KeyPart {
                field_no: 1,
                field_type: FieldType::Str,
            }],
        )
        .unwrap();
        let space = Space::new(def(512), &[sk, pk_def(512)]).unwrap();
        assert_eq!(space.index_count(), 2);
        assert_eq!(space.index(0).unwrap().lock().key_def().iid, 0);
        assert_eq!(space.index(1).unwrap().lock().key_def().iid, 1);
        assert!(space.index(2).is_err());
    }

    #[test]
    fn build_sync_trigger_registry() {
        let mut space = Space::new(def(512), &[pk_def(512)]).unwrap();
        let extra = space.index(0).unwrap();
        let a = space.add_build_sync(Arc::clone(&extra));
        let b = space.add_build_sync(extra);
        assert_ne!(a, b);
        assert_eq!(space.on_replace.len(), 2);
        space.remove_build_sync(a);
        assert_eq!(space.on_replace.len(), 1);
        assert_eq!(space.on_replace[0].id, b);
    }
}
