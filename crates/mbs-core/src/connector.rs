//! The [`Connector`] capability model (C3/C4): a typed view over a single
//! mongod/mongos, a whole replica set, or a sharded cluster.
//!
//! The real network driver behind these trait methods is an external
//! collaborator (spec §1/§6, "Connector (consumed)"); this crate defines the
//! contract and the selection algorithm that walks it, not a MongoDB wire
//! protocol client.

use async_trait::async_trait;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    Server,
    Cluster,
    Sharded,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MongoVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl MongoVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

#[derive(Debug, Clone)]
pub struct ReplicaSetMember {
    pub address: String,
    pub is_primary: bool,
    pub is_secondary: bool,
    pub priority: f64,
    pub lag_seconds: u64,
}

/// Capability set common to every connector variant. Sub-traits
/// ([`MongoServerConnector`], [`ShardedClusterConnector`]) extend this with
/// role-specific operations; concrete types implement exactly the sub-traits
/// that apply and expose them through `as_mongo_server`/`as_sharded` so
/// callers can probe capability without `downcast`/`Any`.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> ConnectorKind;
    fn address(&self) -> &str;
    fn is_replica_member(&self) -> bool {
        false
    }
    fn is_config_server(&self) -> bool {
        false
    }
    fn has_admin_credentials(&self) -> bool {
        false
    }

    async fn is_online(&self) -> bool;
    async fn is_primary(&self) -> Result<bool>;
    async fn is_secondary(&self) -> Result<bool>;
    async fn mongo_version(&self) -> Result<MongoVersion>;
    async fn stats(&self, only_for_db: Option<&str>) -> Result<serde_json::Value>;

    /// Grants `role` on `database` to the connecting user (spec §4.8: the
    /// `restore` role grant issued against the destination before
    /// `mongorestore` runs on Mongo >= 2.6.0). Defaults to a no-op so
    /// connector kinds that never sit behind a restore destination don't
    /// need to implement it.
    async fn grant_role(&self, _database: &str, _role: &str) -> Result<()> {
        Ok(())
    }

    fn as_mongo_server(&self) -> Option<&dyn MongoServerConnector> {
        None
    }
    fn as_sharded(&self) -> Option<&dyn ShardedClusterConnector> {
        None
    }
    fn as_replica_set(&self) -> Option<&dyn ReplicaSetConnector> {
        None
    }
}

/// A connector that can enumerate its replica set's members (a `MongoCluster`
/// in the original's terms: knows the whole topology, not just one member).
#[async_trait]
pub trait ReplicaSetConnector: Connector {
    async fn members(&self) -> Result<Vec<ReplicaSetMember>>;
}

/// A single mongod process reachable directly: the only connector kind the
/// quiescence coordinator can lock/suspend.
#[async_trait]
pub trait MongoServerConnector: Connector {
    async fn fsynclock(&self) -> Result<()>;
    async fn fsyncunlock(&self) -> Result<()>;
    async fn is_server_locked(&self) -> Result<bool>;
}

/// A sharded cluster's mongos entry point, plus balancer control.
#[async_trait]
pub trait ShardedClusterConnector: Connector {
    async fn select_shard_best_secondaries(
        &self,
        max_lag_seconds: u64,
    ) -> Result<Vec<ReplicaSetMember>>;
    async fn is_balancer_active(&self) -> Result<bool>;
    async fn stop_balancer(&self) -> Result<()>;
    async fn resume_balancer(&self) -> Result<()>;
    fn start_balancer_activity_monitor(&self);
    fn stop_balancer_activity_monitor(&self);
    fn balancer_active_during_monitor(&self) -> bool;
}

/// Resolves a member address + selection context into a concrete connector.
/// The real network connect is, like [`Connector`] itself, an external
/// collaborator; this crate only specifies the contract the selector drives.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<std::sync::Arc<dyn Connector>>;
    async fn connect_to_member(&self, address: &str) -> Result<std::sync::Arc<dyn Connector>>;
}
