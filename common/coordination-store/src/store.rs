use etcd_client::{Client, Compare, CompareOp, GetOptions, Txn, TxnOp, TxnResponse};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub endpoints: Vec<String>,
    /// Key prefix for all operations, e.g. "/rebalance-operator/".
    pub prefix: String,
}

/// A decoded value together with the etcd version of the key it was read from.
///
/// The version is the compare-and-swap token: a key that does not exist has
/// version 0, and every write bumps it by one.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: i64,
}

impl<T> Versioned<T> {
    pub fn new(value: T, version: i64) -> Self {
        Self { value, version }
    }
}

/// A single guarded write inside [`EtcdStore::commit`].
#[derive(Debug, Clone)]
pub enum GuardedWrite {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl GuardedWrite {
    pub fn put<T: Serialize>(key: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::Put {
            key: key.into(),
            value: serde_json::to_vec(value)?,
        })
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    fn into_op(self) -> TxnOp {
        match self {
            GuardedWrite::Put { key, value } => TxnOp::put(key, value, None),
            GuardedWrite::Delete { key } => TxnOp::delete(key, None),
        }
    }
}

/// Prefixed etcd client that stores JSON documents and guards every
/// conditional write with the version of the keys it depends on.
///
/// `Client` is `Clone` (wraps an inner `Arc`), so each method clones it cheaply.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    config: StoreConfig,
}

impl EtcdStore {
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        let client = Client::connect(&config.endpoints, None).await?;
        Ok(Self { client, config })
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    // ── Reads ────────────────────────────────────────────────────

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Versioned<T>>> {
        let resp = self.client.clone().get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(Versioned::new(
                serde_json::from_slice(kv.value())?,
                kv.version(),
            ))),
            None => Ok(None),
        }
    }

    pub async fn list<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<Versioned<T>>> {
        let options = GetOptions::new().with_prefix();
        let resp = self.client.clone().get(prefix, Some(options)).await?;
        resp.kvs()
            .iter()
            .map(|kv| {
                let value = serde_json::from_slice(kv.value()).map_err(Error::from)?;
                Ok(Versioned::new(value, kv.version()))
            })
            .collect()
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Write `value` only if `key` does not exist yet.
    ///
    /// Returns `Ok(false)` when somebody else created the key first.
    pub async fn create<T: Serialize>(&self, key: &str, value: &T) -> Result<bool> {
        self.commit(
            vec![(key.to_string(), 0)],
            vec![GuardedWrite::put(key, value)?],
        )
        .await
    }

    /// Overwrite `key` only if it is still at `version`.
    pub async fn replace<T: Serialize>(&self, key: &str, value: &T, version: i64) -> Result<bool> {
        self.commit(
            vec![(key.to_string(), version)],
            vec![GuardedWrite::put(key, value)?],
        )
        .await
    }

    /// Delete `key` only if it is still at `version`.
    pub async fn delete_if_version(&self, key: &str, version: i64) -> Result<bool> {
        self.commit(
            vec![(key.to_string(), version)],
            vec![GuardedWrite::delete(key)],
        )
        .await
    }

    /// Apply all `writes` atomically if every `(key, version)` in `expected`
    /// still matches. Returns `Ok(false)` and writes nothing otherwise.
    pub async fn commit(
        &self,
        expected: Vec<(String, i64)>,
        writes: Vec<GuardedWrite>,
    ) -> Result<bool> {
        let compares: Vec<Compare> = expected
            .into_iter()
            .map(|(key, version)| Compare::version(key, CompareOp::Equal, version))
            .collect();
        let ops: Vec<TxnOp> = writes.into_iter().map(GuardedWrite::into_op).collect();

        let resp = self.txn(Txn::new().when(compares).and_then(ops)).await?;
        Ok(resp.succeeded())
    }

    pub async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        Ok(self.client.clone().txn(txn).await?)
    }
}
