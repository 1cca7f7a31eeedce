//! Routing metadata held by the metadata owner.
//!
//! A partition is identified by the exact shard-key value: moving a
//! partition reassigns that key, and every key that was never moved lives
//! on the collection's primary shard (the first shard registered).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub name: String,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardedCollection {
    pub key: Value,
    pub primary: String,
    #[serde(default)]
    pub moved: BTreeMap<String, String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("shard {0} is already registered with a different host")]
    DuplicateShard(String),

    #[error("no shards registered")]
    NoShards,

    #[error("sharding is not enabled for database {0}")]
    NotEnabled(String),

    #[error("namespace {0} is not sharded")]
    NotSharded(String),

    #[error("namespace {0} is already sharded with a different key")]
    AlreadySharded(String),

    #[error("unknown shard {0}")]
    UnknownShard(String),

    #[error("invalid namespace {0}")]
    InvalidNamespace(String),
}

impl MetadataError {
    pub fn code(&self) -> i64 {
        match self {
            MetadataError::DuplicateShard(_) => 11000,
            MetadataError::NoShards | MetadataError::UnknownShard(_) => 70,
            MetadataError::NotEnabled(_) => 20,
            MetadataError::NotSharded(_) => 61,
            MetadataError::AlreadySharded(_) => 23,
            MetadataError::InvalidNamespace(_) => 73,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    shards: Vec<ShardEntry>,
    #[serde(default)]
    databases: BTreeSet<String>,
    #[serde(default)]
    collections: BTreeMap<String, ShardedCollection>,
}

impl Metadata {
    pub fn shards(&self) -> &[ShardEntry] {
        &self.shards
    }

    /// Register a shard.  Registering the same name and host again is a
    /// no-op.
    pub fn add_shard(&mut self, name: &str, host: &str) -> Result<(), MetadataError> {
        match self.shards.iter().find(|s| s.name == name) {
            Some(existing) if existing.host == host => Ok(()),
            Some(_) => Err(MetadataError::DuplicateShard(name.to_string())),
            None => {
                self.shards.push(ShardEntry {
                    name: name.to_string(),
                    host: host.to_string(),
                });
                Ok(())
            }
        }
    }

    pub fn enable_sharding(&mut self, db: &str) -> Result<(), MetadataError> {
        if self.shards.is_empty() {
            return Err(MetadataError::NoShards);
        }
        self.databases.insert(db.to_string());
        Ok(())
    }

    pub fn shard_collection(&mut self, ns: &str, key: Value) -> Result<(), MetadataError> {
        let db = database_of(ns)?;
        if !self.databases.contains(db) {
            return Err(MetadataError::NotEnabled(db.to_string()));
        }
        if let Some(existing) = self.collections.get(ns) {
            return if existing.key == key {
                Ok(())
            } else {
                Err(MetadataError::AlreadySharded(ns.to_string()))
            };
        }
        let primary = self.shards.first().ok_or(MetadataError::NoShards)?;
        self.collections.insert(
            ns.to_string(),
            ShardedCollection {
                key,
                primary: primary.name.clone(),
                moved: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Reassign the partition holding `key` to shard `to`.
    pub fn move_chunk(&mut self, ns: &str, key: &Value, to: &str) -> Result<(), MetadataError> {
        if !self.shards.iter().any(|s| s.name == to) {
            return Err(MetadataError::UnknownShard(to.to_string()));
        }
        let collection = self
            .collections
            .get_mut(ns)
            .ok_or_else(|| MetadataError::NotSharded(ns.to_string()))?;
        collection.moved.insert(partition_of(key), to.to_string());
        Ok(())
    }

    /// Shard currently owning `key`.
    pub fn locate_owner(&self, ns: &str, key: &Value) -> Result<&ShardEntry, MetadataError> {
        let collection = self
            .collections
            .get(ns)
            .ok_or_else(|| MetadataError::NotSharded(ns.to_string()))?;
        let owner = collection
            .moved
            .get(&partition_of(key))
            .unwrap_or(&collection.primary);
        self.shards
            .iter()
            .find(|s| &s.name == owner)
            .ok_or_else(|| MetadataError::UnknownShard(owner.clone()))
    }
}

fn database_of(ns: &str) -> Result<&str, MetadataError> {
    match ns.split_once('.') {
        Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(db),
        _ => Err(MetadataError::InvalidNamespace(ns.to_string())),
    }
}

fn partition_of(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_shards() -> Metadata {
        let mut meta = Metadata::default();
        meta.add_shard("shard0", "127.0.0.1:20001").unwrap();
        meta.add_shard("shard1", "127.0.0.1:20002").unwrap();
        meta
    }

    #[test]
    fn test_add_shard_is_idempotent() {
        let mut meta = two_shards();
        meta.add_shard("shard0", "127.0.0.1:20001").unwrap();
        assert_eq!(meta.shards().len(), 2);
        let err = meta.add_shard("shard0", "127.0.0.1:29999").unwrap_err();
        assert_eq!(err, MetadataError::DuplicateShard("shard0".to_string()));
        assert_eq!(err.code(), 11000);
    }

    #[test]
    fn test_shard_collection_requires_enabled_database() {
        let mut meta = two_shards();
        let err = meta.shard_collection("app.users", json!({"uid": 1})).unwrap_err();
        assert_eq!(err, MetadataError::NotEnabled("app".to_string()));

        meta.enable_sharding("app").unwrap();
        meta.shard_collection("app.users", json!({"uid": 1})).unwrap();
        meta.shard_collection("app.users", json!({"uid": 1})).unwrap();
        let err = meta.shard_collection("app.users", json!({"name": 1})).unwrap_err();
        assert_eq!(err.code(), 23);
    }

    #[test]
    fn test_enable_sharding_needs_a_shard() {
        let mut meta = Metadata::default();
        assert_eq!(meta.enable_sharding("app").unwrap_err(), MetadataError::NoShards);
    }

    #[test]
    fn test_owner_follows_moves() {
        let mut meta = two_shards();
        meta.enable_sharding("app").unwrap();
        meta.shard_collection("app.users", json!({"uid": 1})).unwrap();

        assert_eq!(meta.locate_owner("app.users", &json!(42)).unwrap().name, "shard0");
        meta.move_chunk("app.users", &json!(42), "shard1").unwrap();
        let owner = meta.locate_owner("app.users", &json!(42)).unwrap();
        assert_eq!(owner.name, "shard1");
        assert_eq!(owner.host, "127.0.0.1:20002");
        // Other keys stay on the primary shard.
        assert_eq!(meta.locate_owner("app.users", &json!(43)).unwrap().name, "shard0");
    }

    #[test]
    fn test_move_rejects_unknown_shard_and_unsharded_ns() {
        let mut meta = two_shards();
        meta.enable_sharding("app").unwrap();
        assert_eq!(
            meta.move_chunk("app.users", &json!("k"), "shard1").unwrap_err(),
            MetadataError::NotSharded("app.users".to_string())
        );
        meta.shard_collection("app.users", json!({"uid": 1})).unwrap();
        assert_eq!(
            meta.move_chunk("app.users", &json!("k"), "shard9").unwrap_err(),
            MetadataError::UnknownShard("shard9".to_string())
        );
    }

    #[test]
    fn test_invalid_namespace() {
        let mut meta = two_shards();
        for ns in ["users", ".users", "app."] {
            assert_eq!(
                meta.shard_collection(ns, json!({"k": 1})).unwrap_err().code(),
                73,
                "{ns}"
            );
        }
    }
}
