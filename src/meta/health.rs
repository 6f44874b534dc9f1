//! Instance liveness monitor
//!
//! Runs on every replica but only acts on the leader. An instance that has not
//! heartbeated for longer than the dead threshold is marked DEAD through the
//! log, so followers learn about it the same way they learn everything else.

use crate::common::timestamp_now_micros;
use crate::meta::manager::ClusterManager;
use crate::meta::model::Mutation;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// One liveness pass at `now_us`; returns the instances marked DEAD
pub async fn scan_and_mark_dead(manager: &ClusterManager, now_us: i64) -> Vec<String> {
    if !manager.is_leader() {
        return Vec::new();
    }

    let threshold_us = manager.config().dead_threshold().as_micros() as i64;
    let stale = manager.registry().stale_instances(now_us, threshold_us);
    if stale.is_empty() {
        return stale;
    }

    let results = join_all(stale.iter().map(|address| {
        manager.submit(Mutation::SetInstanceDead {
            address: address.clone(),
        })
    }))
    .await;

    stale
        .into_iter()
        .zip(results)
        .filter_map(|(address, result)| match result {
            Ok(()) => {
                tracing::warn!("Instance {} missed heartbeats, marked DEAD", address);
                Some(address)
            }
            Err(e) => {
                tracing::warn!("Failed to mark instance {} DEAD: {}", address, e);
                None
            }
        })
        .collect()
}

/// Periodic liveness scan
pub fn start_health_check_task(manager: Arc<ClusterManager>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // skip the immediate tick: give a fresh leader's reset time to land
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let dead = scan_and_mark_dead(&manager, timestamp_now_micros()).await;
            if !dead.is_empty() {
                tracing::info!("Health check marked {} instance(s) DEAD", dead.len());
            }
        }
    })
}
