//! Data dictionary: system space ids, the space cache, user and
//! function caches, privileges and authentication data.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use spindle_error::{Result, SpindleError};
use spindle_index::IteratorType;
use spindle_types::{TupleRef, Value};

use crate::space::Space;

/// System space ids occupy the reserved band `[256, 512)`.
pub const SC_SYSTEM_ID_MIN: u32 = 256;
pub const SC_SYSTEM_ID_MAX: u32 = 512;

pub const SC_SCHEMA_ID: u32 = 272;
pub const SC_SPACE_ID: u32 = 280;
pub const SC_INDEX_ID: u32 = 288;
pub const SC_FUNC_ID: u32 = 296;
pub const SC_USER_ID: u32 = 304;
pub const SC_PRIV_ID: u32 = 312;
pub const SC_CLUSTER_ID: u32 = 320;

/// Reserved users. None of them can be dropped.
pub const GUEST: u32 = 0;
pub const ADMIN: u32 = 1;
pub const PUBLIC: u32 = 2;

/// Length of a chap-sha1 scramble (a sha-1 digest).
pub const SCRAMBLE_SIZE: usize = 20;
/// Length of the base64 form stored in `_user`.
pub const SCRAMBLE_BASE64_SIZE: usize = 28;

/// Access bits carried by privilege records.
pub const ACCESS_READ: u8 = 1;
pub const ACCESS_WRITE: u8 = 2;
pub const ACCESS_EXECUTE: u8 = 4;
pub const ACCESS_FULL: u8 = ACCESS_READ | ACCESS_WRITE | ACCESS_EXECUTE;

thread_local! {
    static CURRENT_UID: Cell<u32> = const { Cell::new(ADMIN) };
}

/// The uid requests on this fiber run under.
pub fn current_uid() -> u32 {
    CURRENT_UID.with(Cell::get)
}

/// Switch the current fiber's effective user.
pub fn set_current_uid(uid: u32) {
    CURRENT_UID.with(|c| c.set(uid));
}

/// Only the object's owner or the admin may perform a DDL change on it.
pub fn access_check_ddl(schema: &Schema, owner_uid: u32) -> Result<()> {
    let uid = current_uid();
    if owner_uid != uid && uid != ADMIN {
        let user = schema
            .users
            .get(&uid)
            .map_or_else(|| uid.to_string(), |u| u.name.clone());
        return Err(SpindleError::AccessDenied {
            action: "Create or drop".to_owned(),
            user,
        });
    }
    Ok(())
}

/// User or role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserType {
    User,
    Role,
}

impl UserType {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "role" => Ok(Self::Role),
            other => Err(SpindleError::illegal_params(format!(
                "unknown user type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub uid: u32,
    pub owner: u32,
    pub name: String,
    pub user_type: UserType,
    /// chap-sha1 scramble, when authentication data is set.
    pub auth: Option<[u8; SCRAMBLE_SIZE]>,
    pub universal_access: u8,
}

#[derive(Debug, Clone)]
pub struct Func {
    pub fid: u32,
    pub uid: u32,
    pub name: String,
    /// Per-user access bits. Nobody but the owner until granted.
    pub access: BTreeMap<u32, u8>,
}

/// Object a privilege applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaObjectType {
    Universe,
    Space,
    Function,
}

impl SchemaObjectType {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "universe" => Ok(Self::Universe),
            "space" => Ok(Self::Space),
            "function" => Ok(Self::Function),
            other => Err(SpindleError::UnknownSchemaObject {
                object: other.to_owned(),
            }),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Universe => "universe",
            Self::Space => "space",
            Self::Function => "function",
        }
    }
}

/// A decoded `_priv` record.
#[derive(Debug, Clone)]
pub struct PrivDef {
    pub grantor_id: u32,
    pub grantee_id: u32,
    pub object_type: SchemaObjectType,
    pub object_id: u32,
    pub access: u8,
}

impl PrivDef {
    /// `( grantor, grantee, object_type, object_id, access )`
    pub fn from_tuple(tuple: &TupleRef) -> Result<Self> {
        let object_type = SchemaObjectType::from_name(tuple.field_str(2)?)?;
        let access = tuple.field_u32(4)?;
        let access = u8::try_from(access & u32::from(ACCESS_FULL)).expect("masked to u8");
        Ok(Self {
            grantor_id: tuple.field_u32(0)?,
            grantee_id: tuple.field_u32(1)?,
            object_type,
            object_id: tuple.field_u32(3)?,
            access,
        })
    }
}

/// Parse the `_user` auth field. The field is a map (encoded as an
/// array of `[mechanism, payload]` pairs); only `chap-sha1` is
/// recognized, and its payload must be base64 whose decoded length is
/// zero or exactly one scramble.
pub fn parse_auth_data(user_name: &str, auth: &Value) -> Result<Option<[u8; SCRAMBLE_SIZE]>> {
    let Some(pairs) = auth.as_array() else {
        return Ok(None);
    };
    for pair in pairs {
        let Some(pair) = pair.as_array() else {
            continue;
        };
        let (Some(mech), Some(payload)) = (
            pair.first().and_then(Value::as_str),
            pair.get(1).and_then(Value::as_str),
        ) else {
            continue;
        };
        if !mech.eq_ignore_ascii_case("chap-sha1") {
            continue;
        }
        if payload.is_empty() {
            return Ok(None);
        }
        if payload.len() != SCRAMBLE_BASE64_SIZE {
            return Err(SpindleError::CreateUser {
                user: user_name.to_owned(),
                detail: "invalid user password".to_owned(),
            });
        }
        let decoded = BASE64.decode(payload).map_err(|_| SpindleError::CreateUser {
            user: user_name.to_owned(),
            detail: "invalid user password".to_owned(),
        })?;
        let scramble: [u8; SCRAMBLE_SIZE] =
            decoded
                .try_into()
                .map_err(|_| SpindleError::CreateUser {
                    user: user_name.to_owned(),
                    detail: "invalid user password".to_owned(),
                })?;
        return Ok(Some(scramble));
    }
    Ok(None)
}

/// Build a user from a `_user` tuple:
/// `( uid, owner, name, type, auth? )`.
pub fn user_from_tuple(schema: &Schema, tuple: &TupleRef) -> Result<User> {
    let uid = tuple.field_u32(0)?;
    let owner = tuple.field_u32(1)?;
    let name = tuple.field_str(2)?.to_owned();
    let user_type = UserType::from_name(tuple.field_str(3)?)?;
    access_check_ddl(schema, owner)?;
    let auth = match tuple.field(4) {
        Some(field) => {
            let has_payload = field
                .as_array()
                .is_some_and(|pairs| !pairs.is_empty());
            if user_type == UserType::Role && has_payload {
                return Err(SpindleError::CreateUser {
                    user: name,
                    detail: "authentication data can not be set for a role".to_owned(),
                });
            }
            parse_auth_data(&name, field)?
        }
        None => None,
    };
    Ok(User {
        uid,
        owner,
        name,
        user_type,
        auth,
        universal_access: 0,
    })
}

/// Build a function from a `_func` tuple: `( fid, uid, name )`.
pub fn func_from_tuple(tuple: &TupleRef) -> Result<Func> {
    Ok(Func {
        fid: tuple.field_u32(0)?,
        uid: tuple.field_u32(1)?,
        name: tuple.field_str(2)?.to_owned(),
        access: BTreeMap::new(),
    })
}

/// The in-memory data dictionary: every live space plus the user and
/// function caches. Mutated only by the main cord.
#[derive(Default)]
pub struct Schema {
    spaces: HashMap<u32, Space>,
    pub users: HashMap<u32, User>,
    pub funcs: HashMap<u32, Func>,
}

impl Schema {
    pub fn space(&self, id: u32) -> Result<&Space> {
        self.spaces.get(&id).ok_or_else(|| SpindleError::NoSuchSpace {
            space: id.to_string(),
        })
    }

    pub fn space_mut(&mut self, id: u32) -> Result<&mut Space> {
        self.spaces
            .get_mut(&id)
            .ok_or_else(|| SpindleError::NoSuchSpace {
                space: id.to_string(),
            })
    }

    pub fn space_by_id(&self, id: u32) -> Option<&Space> {
        self.spaces.get(&id)
    }

    pub fn space_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.spaces.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Install a space in the cache; returns the displaced one.
    pub fn cache_replace(&mut self, space: Space) -> Option<Space> {
        self.spaces.insert(space.id(), space)
    }

    /// Remove a space from the cache.
    pub fn cache_delete(&mut self, id: u32) -> Option<Space> {
        self.spaces.remove(&id)
    }

    /// Whether any privilege record references the object. Scans the
    /// grantee index of `_priv`.
    pub fn find_grants(&self, object_type: SchemaObjectType, object_id: u32) -> Result<bool> {
        let privs = self.space(SC_PRIV_ID)?;
        let pk = privs.primary_key()?;
        let rows = pk.lock().iterate(IteratorType::All, &[])?;
        for row in rows {
            let def = PrivDef::from_tuple(&row)?;
            if def.object_type == object_type && def.object_id == object_id {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether `uid` owns any spaces or functions, or holds any
    /// privileges. Queries the `owner` secondary of each catalog.
    pub fn user_has_data(&self, uid: u32) -> Result<bool> {
        for space_id in [SC_SPACE_ID, SC_FUNC_ID, SC_PRIV_ID] {
            let space = self.space(space_id)?;
            let Some(owner_index) = space.index_opt(1) else {
                continue;
            };
            let matches = owner_index
                .lock()
                .iterate(IteratorType::Eq, &[Value::Unsigned(u64::from(uid))])?;
            if !matches.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Apply or revoke a privilege in the caches. `access == 0`
    /// revokes.
    pub fn grant_or_revoke(&mut self, priv_def: &PrivDef) {
        let Some(grantee) = self.users.get(&priv_def.grantee_id).cloned() else {
            return;
        };
        match priv_def.object_type {
            SchemaObjectType::Universe => {
                if let Some(user) = self.users.get_mut(&grantee.uid) {
                    user.universal_access = priv_def.access;
                }
            }
            SchemaObjectType::Space => {
                if let Some(space) = self.spaces.get_mut(&priv_def.object_id) {
                    if priv_def.access == 0 {
                        space.access.remove(&grantee.uid);
                    } else {
                        space.access.insert(grantee.uid, priv_def.access);
                    }
                }
            }
            SchemaObjectType::Function => {
                if let Some(func) = self.funcs.get_mut(&priv_def.object_id) {
                    if priv_def.access == 0 {
                        func.access.remove(&grantee.uid);
                    } else {
                        func.access.insert(grantee.uid, priv_def.access);
                    }
                }
            }
        }
    }

    /// Validate a grant: both parties exist and the grantor owns the
    /// object (the universe belongs to the admin).
    pub fn priv_def_check(&self, priv_def: &PrivDef) -> Result<()> {
        let grantor =
            self.users
                .get(&priv_def.grantor_id)
                .ok_or_else(|| SpindleError::NoSuchUser {
                    user: priv_def.grantor_id.to_string(),
                })?;
        if !self.users.contains_key(&priv_def.grantee_id) {
            return Err(SpindleError::NoSuchUser {
                user: priv_def.grantee_id.to_string(),
            });
        }
        access_check_ddl(self, grantor.uid)?;
        match priv_def.object_type {
            SchemaObjectType::Universe => {
                if grantor.uid != ADMIN {
                    return Err(SpindleError::AccessDenied {
                        action: "Grant".to_owned(),
                        user: grantor.name.clone(),
                    });
                }
            }
            SchemaObjectType::Space => {
                let space = self.space(priv_def.object_id)?;
                if space.def.uid != grantor.uid {
                    return Err(SpindleError::AccessDenied {
                        action: "Grant".to_owned(),
                        user: grantor.name.clone(),
                    });
                }
            }
            SchemaObjectType::Function => {
                let func = self
                    .funcs
                    .get(&priv_def.object_id)
                    .ok_or_else(|| SpindleError::NoSuchFunction {
                        name: priv_def.object_id.to_string(),
                    })?;
                if func.uid != grantor.uid {
                    return Err(SpindleError::AccessDenied {
                        action: "Grant".to_owned(),
                        user: grantor.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use spindle_types::{Tuple, TupleFormat};

    fn tuple(fields: Vec<Value>) -> TupleRef {
        Tuple::from_values(&Arc::new(TupleFormat::default()), fields).unwrap()
    }

    #[test]
    fn auth_data_length_is_enforced() {
        let good = BASE64.encode([7u8; SCRAMBLE_SIZE]);
        assert_eq!(good.len(), SCRAMBLE_BASE64_SIZE);
        let auth = Value::Array(vec![Value::Array(vec![
            Value::Str("chap-sha1".into()),
            Value::Str(good),
        ])]);
        let scramble = parse_auth_data("u", &auth).unwrap().unwrap();
        assert_eq!(scramble, [7u8; SCRAMBLE_SIZE]);

        let auth = Value::Array(vec![Value::Array(vec![
            Value::Str("chap-sha1".into()),
            Value::Str("dG9vc2hvcnQ=".into()),
        ])]);
        assert!(parse_auth_data("u", &auth).is_err());

        // An empty payload means no password.
        let auth = Value::Array(vec![Value::Array(vec![
            Value::Str("chap-sha1".into()),
            Value::Str(String::new()),
        ])]);
        assert!(parse_auth_data("u", &auth).unwrap().is_none());
    }

    #[test]
    fn unknown_auth_mechanisms_are_ignored() {
        let auth = Value::Array(vec![Value::Array(vec![
            Value::Str("chap-md5".into()),
            Value::Str("whatever".into()),
        ])]);
        assert!(parse_auth_data("u", &auth).unwrap().is_none());
    }

    #[test]
    fn roles_cannot_carry_auth_data() {
        let schema = Schema::default();
        let t = tuple(vec![
            Value::Unsigned(42),
            Value::Unsigned(1),
            Value::Str("ops".into()),
            Value::Str("role".into()),
            Value::Array(vec![Value::Array(vec![
                Value::Str("chap-sha1".into()),
                Value::Str(BASE64.encode([1u8; SCRAMBLE_SIZE])),
            ])]),
        ]);
        let err = user_from_tuple(&schema, &t).unwrap_err();
        assert!(err.to_string().contains("role"));
    }

    #[test]
    fn access_check_ddl_owner_and_admin_only() {
        let mut schema = Schema::default();
        schema.users.insert(
            5,
            User {
                uid: 5,
                owner: ADMIN,
                name: "eve".to_owned(),
                user_type: UserType::User,
                auth: None,
                universal_access: 0,
            },
        );
        set_current_uid(5);
        assert!(access_check_ddl(&schema, 5).is_ok());
        let err = access_check_ddl(&schema, ADMIN).unwrap_err();
        assert!(matches!(err, SpindleError::AccessDenied { .. }));
        set_current_uid(ADMIN);
        assert!(access_check_ddl(&schema, 5).is_ok());
    }

    #[test]
    fn priv_from_tuple() {
        let t = tuple(vec![
            Value::Unsigned(1),
            Value::Unsigned(5),
            Value::Str("space".into()),
            Value::Unsigned(512),
            Value::Unsigned(u64::from(ACCESS_READ)),
        ]);
        let def = PrivDef::from_tuple(&t).unwrap();
        assert_eq!(def.grantor_id, 1);
        assert_eq!(def.grantee_id, 5);
        assert_eq!(def.object_type, SchemaObjectType::Space);
        assert_eq!(def.object_id, 512);
        assert_eq!(def.access, ACCESS_READ);

        let t = tuple(vec![
            Value::Unsigned(1),
            Value::Unsigned(5),
            Value::Str("sequence".into()),
            Value::Unsigned(0),
            Value::Unsigned(0),
        ]);
        assert!(matches!(
            PrivDef::from_tuple(&t),
            Err(SpindleError::UnknownSchemaObject { .. })
        ));
    }
}
