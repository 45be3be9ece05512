use async_trait::async_trait;
use coordination_store::store::GuardedWrite;
use coordination_store::util::validate_identifier;
use coordination_store::{EtcdStore, Versioned};

use crate::error::Result;
use crate::types::{Cluster, NodePool, RebalanceRequest};

/// Persistence for the operator's resources.
///
/// Every write is conditional on the version the caller read. A `false`
/// return means a concurrent writer got there first and nothing was written.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn list_clusters(&self) -> Result<Vec<Versioned<Cluster>>>;

    async fn get_cluster(&self, name: &str) -> Result<Option<Versioned<Cluster>>>;

    async fn replace_cluster(&self, cluster: &Cluster, version: i64) -> Result<bool>;

    async fn list_pools(&self, cluster: &str) -> Result<Vec<Versioned<NodePool>>>;

    /// Write `updated` pools in one transaction, guarded by the versions of
    /// every pool in `read`.
    async fn commit_pools(&self, read: &[Versioned<NodePool>], updated: &[NodePool])
        -> Result<bool>;

    async fn get_rebalance(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<Versioned<RebalanceRequest>>>;

    async fn list_rebalances(&self, cluster: &str) -> Result<Vec<Versioned<RebalanceRequest>>>;

    async fn create_rebalance(&self, request: &RebalanceRequest) -> Result<bool>;

    async fn update_rebalance(&self, request: &RebalanceRequest, version: i64) -> Result<bool>;

    async fn delete_rebalance(&self, cluster: &str, name: &str, version: i64) -> Result<bool>;
}

/// All etcd key patterns used by the operator.
///
/// ```text
/// {prefix}clusters/{cluster}
/// {prefix}pools/{cluster}/{pool}
/// {prefix}rebalances/{cluster}/{name}
/// ```
///
/// The leader key (`{prefix}operator/leader`) is managed by the
/// `coordination-store` crate's leader election module.
enum StoreKey<'a> {
    Cluster(&'a str),
    ClustersPrefix,
    Pool { cluster: &'a str, pool: &'a str },
    PoolsForCluster(&'a str),
    Rebalance { cluster: &'a str, name: &'a str },
    RebalancesForCluster(&'a str),
}

impl StoreKey<'_> {
    fn resolve(&self, prefix: &str) -> String {
        match self {
            StoreKey::Cluster(name) => format!("{prefix}clusters/{name}"),
            StoreKey::ClustersPrefix => format!("{prefix}clusters/"),
            StoreKey::Pool { cluster, pool } => format!("{prefix}pools/{cluster}/{pool}"),
            StoreKey::PoolsForCluster(cluster) => format!("{prefix}pools/{cluster}/"),
            StoreKey::Rebalance { cluster, name } => {
                format!("{prefix}rebalances/{cluster}/{name}")
            }
            StoreKey::RebalancesForCluster(cluster) => format!("{prefix}rebalances/{cluster}/"),
        }
    }
}

/// etcd-backed [`ResourceStore`].
#[derive(Clone)]
pub struct EtcdResourceStore {
    inner: EtcdStore,
}

impl EtcdResourceStore {
    pub fn new(inner: EtcdStore) -> Self {
        Self { inner }
    }

    fn key(&self, k: StoreKey<'_>) -> String {
        k.resolve(self.inner.prefix())
    }

    fn pool_key(&self, pool: &NodePool) -> Result<String> {
        validate_identifier(&pool.cluster)?;
        validate_identifier(&pool.name)?;
        Ok(self.key(StoreKey::Pool {
            cluster: &pool.cluster,
            pool: &pool.name,
        }))
    }

    fn rebalance_key(&self, cluster: &str, name: &str) -> Result<String> {
        validate_identifier(cluster)?;
        validate_identifier(name)?;
        Ok(self.key(StoreKey::Rebalance { cluster, name }))
    }
}

#[async_trait]
impl ResourceStore for EtcdResourceStore {
    async fn list_clusters(&self) -> Result<Vec<Versioned<Cluster>>> {
        let key = self.key(StoreKey::ClustersPrefix);
        Ok(self.inner.list(&key).await?)
    }

    async fn get_cluster(&self, name: &str) -> Result<Option<Versioned<Cluster>>> {
        validate_identifier(name)?;
        let key = self.key(StoreKey::Cluster(name));
        Ok(self.inner.get(&key).await?)
    }

    async fn replace_cluster(&self, cluster: &Cluster, version: i64) -> Result<bool> {
        validate_identifier(&cluster.name)?;
        let key = self.key(StoreKey::Cluster(&cluster.name));
        Ok(self.inner.replace(&key, cluster, version).await?)
    }

    async fn list_pools(&self, cluster: &str) -> Result<Vec<Versioned<NodePool>>> {
        validate_identifier(cluster)?;
        let key = self.key(StoreKey::PoolsForCluster(cluster));
        Ok(self.inner.list(&key).await?)
    }

    async fn commit_pools(
        &self,
        read: &[Versioned<NodePool>],
        updated: &[NodePool],
    ) -> Result<bool> {
        let mut expected = Vec::with_capacity(read.len());
        for pool in read {
            expected.push((self.pool_key(&pool.value)?, pool.version));
        }
        let mut writes = Vec::with_capacity(updated.len());
        for pool in updated {
            writes.push(GuardedWrite::put(self.pool_key(pool)?, pool)?);
        }
        Ok(self.inner.commit(expected, writes).await?)
    }

    async fn get_rebalance(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<Versioned<RebalanceRequest>>> {
        let key = self.rebalance_key(cluster, name)?;
        Ok(self.inner.get(&key).await?)
    }

    async fn list_rebalances(&self, cluster: &str) -> Result<Vec<Versioned<RebalanceRequest>>> {
        validate_identifier(cluster)?;
        let key = self.key(StoreKey::RebalancesForCluster(cluster));
        Ok(self.inner.list(&key).await?)
    }

    async fn create_rebalance(&self, request: &RebalanceRequest) -> Result<bool> {
        let key = self.rebalance_key(&request.cluster, &request.name)?;
        Ok(self.inner.create(&key, request).await?)
    }

    async fn update_rebalance(&self, request: &RebalanceRequest, version: i64) -> Result<bool> {
        let key = self.rebalance_key(&request.cluster, &request.name)?;
        Ok(self.inner.replace(&key, request, version).await?)
    }

    async fn delete_rebalance(&self, cluster: &str, name: &str, version: i64) -> Result<bool> {
        let key = self.rebalance_key(cluster, name)?;
        Ok(self.inner.delete_if_version(&key, version).await?)
    }
}
