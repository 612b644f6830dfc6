//! Cluster identity: the cluster UUID and the replica roster.

use std::collections::BTreeMap;

use spindle_error::{Result, SpindleError};
use tracing::info;
use uuid::Uuid;

/// Width of the vector clock; server ids at or above it cannot be
/// tracked. Id 0 is the anonymous id used by snapshot rows.
pub const VCLOCK_MAX: u32 = 32;

/// Whether a server id falls in the reserved band.
pub fn server_id_is_reserved(id: u32) -> bool {
    id == 0 || id >= VCLOCK_MAX
}

/// Cluster-wide identity state.
#[derive(Debug, Default)]
pub struct Cluster {
    cluster_id: Option<Uuid>,
    servers: BTreeMap<u32, Uuid>,
}

impl Cluster {
    pub fn cluster_id(&self) -> Option<Uuid> {
        self.cluster_id
    }

    /// Set the cluster UUID. Happens during early recovery, before any
    /// WAL entry; write-once thereafter.
    pub fn set_cluster_id(&mut self, uuid: Uuid) {
        info!(cluster_uuid = %uuid, "cluster id assigned");
        self.cluster_id = Some(uuid);
    }

    pub fn servers(&self) -> &BTreeMap<u32, Uuid> {
        &self.servers
    }

    /// Register a joined server in the roster.
    pub fn add_server(&mut self, server_id: u32, uuid: Uuid) -> Result<()> {
        if server_id_is_reserved(server_id) {
            return Err(SpindleError::ServerIdIsReserved { id: server_id });
        }
        info!(server_id, server_uuid = %uuid, "server registered in the cluster");
        self.servers.insert(server_id, uuid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_band() {
        assert!(server_id_is_reserved(0));
        assert!(!server_id_is_reserved(1));
        assert!(!server_id_is_reserved(VCLOCK_MAX - 1));
        assert!(server_id_is_reserved(VCLOCK_MAX));
        assert!(server_id_is_reserved(u32::MAX));
    }

    #[test]
    fn roster() {
        let mut cluster = Cluster::default();
        let uuid = Uuid::new_v4();
        cluster.add_server(3, uuid).unwrap();
        assert_eq!(cluster.servers().get(&3), Some(&uuid));
        assert!(cluster.add_server(0, uuid).is_err());
    }
}
