use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use etcd_client::{Client, Compare, CompareOp, PutOptions, Txn, TxnOp};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// Identifier for this candidate (e.g. pod name).
    pub name: String,
    /// etcd key holding the leader record.
    pub leader_key: String,
    /// TTL of the leader lease. The key expires this long after the leader dies.
    pub lease_ttl: i64,
    pub keepalive_interval: Duration,
    /// Pause between election attempts, and after a term ends.
    pub retry_interval: Duration,
}

/// Written to the leader key when leadership is acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    pub holder: String,
    pub lease_id: i64,
}

/// Campaign for leadership forever and run `term` whenever elected.
///
/// `term` receives a token that is cancelled when the lease can no longer be
/// kept alive. When `term` returns, for whatever reason, the lease is revoked
/// and the candidate campaigns again after `retry_interval`. The outer
/// `cancel` token ends the campaign.
///
/// The term's error type only needs to absorb store errors, so callers can
/// keep their own error enum.
pub async fn run_as_leader<F, Fut, E>(
    client: Client,
    config: LeaderElectionConfig,
    cancel: CancellationToken,
    term: F,
) -> std::result::Result<(), E>
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = std::result::Result<(), E>>,
    E: From<Error> + Display,
{
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            outcome = campaign(&client, &config, &cancel, &term) => outcome,
        };

        match outcome {
            Ok(true) => tracing::info!(name = %config.name, "leadership term ended"),
            Ok(false) => {
                tracing::debug!(name = %config.name, "another candidate is leader, standing by")
            }
            Err(e) => {
                tracing::warn!(name = %config.name, error = %e, "leadership term ended with error")
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(config.retry_interval) => {}
        }
    }
}

/// One election attempt. Returns `Ok(false)` if somebody else holds the key.
async fn campaign<F, Fut, E>(
    client: &Client,
    config: &LeaderElectionConfig,
    cancel: &CancellationToken,
    term: &F,
) -> std::result::Result<bool, E>
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = std::result::Result<(), E>>,
    E: From<Error>,
{
    let lease_id = client
        .clone()
        .lease_grant(config.lease_ttl, None)
        .await
        .map_err(Error::from)?
        .id();

    if !claim(client, &config.leader_key, &config.name, lease_id).await? {
        drop(client.clone().lease_revoke(lease_id).await);
        return Ok(false);
    }

    tracing::info!(name = %config.name, lease_id, "acquired leadership");

    let term_cancel = cancel.child_token();
    let keepalive = {
        let client = client.clone();
        let interval = config.keepalive_interval;
        let token = term_cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = keep_lease_alive(client, lease_id, interval, token.clone()).await {
                tracing::error!(error = %e, "leader lease lost, ending term");
                token.cancel();
            }
        })
    };

    let result = term(term_cancel.clone()).await;

    term_cancel.cancel();
    drop(keepalive.await);
    drop(client.clone().lease_revoke(lease_id).await);

    result.map(|()| true)
}

/// CAS on the leader key: succeed only if it does not exist (version == 0).
async fn claim(client: &Client, key: &str, holder: &str, lease_id: i64) -> Result<bool> {
    let record = LeaderRecord {
        holder: holder.to_string(),
        lease_id,
    };

    let txn = Txn::new()
        .when(vec![Compare::version(key, CompareOp::Equal, 0)])
        .and_then(vec![TxnOp::put(
            key,
            serde_json::to_vec(&record)?,
            Some(PutOptions::new().with_lease(lease_id)),
        )]);

    Ok(client.clone().txn(txn).await?.succeeded())
}

async fn keep_lease_alive(
    mut client: Client,
    lease_id: i64,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let (mut keeper, mut responses) = client.lease_keep_alive(lease_id).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {
                keeper.keep_alive().await?;
                match responses.message().await? {
                    Some(resp) if resp.ttl() > 0 => {}
                    _ => return Err(Error::LeadershipLost),
                }
            }
        }
    }
}
