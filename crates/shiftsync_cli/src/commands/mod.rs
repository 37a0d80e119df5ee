//! CLI command implementations.

pub mod conflicts;
pub mod dump_oplog;
pub mod inspect;
pub mod verify;

use shiftsync_core::{MergeRuleRegistry, Replica, ReplicaConfig};
use shiftsync_protocol::{ActorId, DeviceId};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How commands open a replica.
pub struct OpenOptions {
    /// Device the replica belongs to.
    pub device: String,
    /// Optional merge rule file.
    pub rules: Option<PathBuf>,
}

impl OpenOptions {
    fn registry(&self) -> Result<MergeRuleRegistry, Box<dyn std::error::Error>> {
        Ok(match &self.rules {
            Some(path) => MergeRuleRegistry::from_json(&std::fs::read_to_string(path)?)?,
            None => MergeRuleRegistry::standard()?,
        })
    }

    /// Opens an existing replica. Fails if the directory is missing or
    /// held by another process.
    pub fn open(&self, path: &Path) -> Result<Replica, Box<dyn std::error::Error>> {
        let config = ReplicaConfig::new(DeviceId::new(self.device.as_str())?, ActorId::new("operator")?)
            .create_if_missing(false);
        Ok(Replica::open(path, config, Arc::new(self.registry()?))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shiftsync_protocol::{EntityId, EntityType, FieldPath, OpKind, OpValue};

    fn options() -> OpenOptions {
        OpenOptions {
            device: "tablet-1".into(),
            rules: None,
        }
    }

    fn seeded() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let config = ReplicaConfig::new(DeviceId::new("tablet-1").unwrap(), ActorId::new("crew").unwrap());
        let replica =
            Replica::open(dir.path(), config, Arc::new(MergeRuleRegistry::standard().unwrap())).unwrap();
        replica
            .record(EntityType::Asset, EntityId::new("loader-3").unwrap(), OpKind::Create, None, None)
            .unwrap();
        replica
            .record(
                EntityType::Asset,
                EntityId::new("loader-3").unwrap(),
                OpKind::Update,
                Some(FieldPath::parse("status").unwrap()),
                Some(OpValue::text("DOWN")),
            )
            .unwrap();
        dir
    }

    #[test]
    fn commands_run_against_a_replica() {
        let dir = seeded();
        let open = options();

        inspect::run(dir.path(), &open, "json").unwrap();
        verify::run(dir.path(), &open).unwrap();
        dump_oplog::run(dir.path(), Some(1), 0, "text").unwrap();
        conflicts::run(dir.path(), &open, true, "json").unwrap();

        let replica = open.open(dir.path()).unwrap();
        assert_eq!(replica.stats().unwrap().operations, 2);
    }

    #[test]
    fn missing_replica_is_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nowhere");
        assert!(options().open(&missing).is_err());
        assert!(!missing.exists());
    }

    #[test]
    fn bad_rule_file_is_reported() {
        let dir = seeded();
        let rules = dir.path().join("rules.json");
        std::fs::write(&rules, "{ not json").unwrap();
        let open = OpenOptions {
            device: "tablet-1".into(),
            rules: Some(rules),
        };
        assert!(open.open(dir.path()).is_err());
    }
}
