use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::lease::Lease;

/// Leases this worker should pick up or let go of in one balancing pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Rebalance {
    pub to_acquire: Vec<Lease>,
    pub to_release: Vec<Lease>,
}

/// Decides which leases a worker should own.
///
/// The load balancer calls `select_leases` once per pass with a fresh scan of
/// the lease store. Implementations are pure: they never write and never look
/// at anything but their arguments.
pub trait LoadBalancingStrategy: Send + Sync {
    /// - `all_leases`: every lease in the store
    /// - `workers`: names of workers known to be alive (presence records)
    /// - `me`: the calling worker
    fn select_leases(&self, all_leases: &[Lease], workers: &[String], me: &str) -> Rebalance;

    /// Acquire-only view: the leases `me` would take if it were the only
    /// known worker. Presence and releases are ignored, so this is for callers
    /// that just want to know what is claimable, not for balancing.
    fn select_leases_to_acquire(&self, all_leases: &[Lease], me: &str) -> Vec<Lease> {
        self.select_leases(all_leases, &[], me).to_acquire
    }
}

/// Spreads leases evenly across live workers without ever taking a lease
/// from a live owner.
///
/// With N leases and W known workers every worker aims for N / W leases, and
/// the N % W workers currently holding the most get one more, so a balanced
/// fleet stays put. A worker under its quota claims expired or unowned leases,
/// the ones idle longest first. A worker over its quota releases its surplus
/// (highest partition tokens first) so others can claim it.
pub struct EqualPartitionsStrategy {
    expiration_interval: Duration,
    min_lease_count: usize,
    max_lease_count: usize,
}

impl EqualPartitionsStrategy {
    pub fn new(expiration_interval: Duration, min_lease_count: usize, max_lease_count: usize) -> Self {
        Self {
            expiration_interval,
            min_lease_count,
            max_lease_count,
        }
    }

    fn clamp(&self, quota: usize) -> usize {
        let mut quota = quota.max(self.min_lease_count);
        if self.max_lease_count > 0 {
            quota = quota.min(self.max_lease_count);
        }
        quota
    }

    fn select_at(
        &self,
        now: DateTime<Utc>,
        all_leases: &[Lease],
        workers: &[String],
        me: &str,
    ) -> Rebalance {
        if all_leases.is_empty() {
            return Rebalance::default();
        }

        let mut expired: Vec<&Lease> = Vec::new();
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        let mut mine: Vec<&Lease> = Vec::new();

        for lease in all_leases {
            match lease.owner.as_deref() {
                Some(owner) if !lease.is_expired(now, self.expiration_interval) => {
                    *counts.entry(owner).or_default() += 1;
                    if owner == me {
                        mine.push(lease);
                    }
                }
                _ => expired.push(lease),
            }
        }

        let known: BTreeSet<&str> = workers
            .iter()
            .map(String::as_str)
            .chain(counts.keys().copied())
            .chain(std::iter::once(me))
            .collect();

        let total = all_leases.len();
        let base = total / known.len();
        let extra = total % known.len();

        // Most loaded first, ties by name.
        let mut ranked: Vec<&str> = known.into_iter().collect();
        ranked.sort_by(|a, b| {
            let load_a = counts.get(a).copied().unwrap_or(0);
            let load_b = counts.get(b).copied().unwrap_or(0);
            load_b.cmp(&load_a).then_with(|| a.cmp(b))
        });
        let rank = ranked.iter().position(|w| *w == me).unwrap_or(ranked.len());
        let quota = self.clamp(if rank < extra { base + 1 } else { base });

        let owned = mine.len();
        let mut rebalance = Rebalance::default();

        if owned > quota {
            mine.sort_by(|a, b| compare_tokens(&b.partition_token, &a.partition_token));
            rebalance.to_release = mine
                .into_iter()
                .take(owned - quota)
                .cloned()
                .collect();
        } else if owned < quota {
            expired.sort_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| compare_tokens(&a.partition_token, &b.partition_token))
            });
            rebalance.to_acquire = expired
                .into_iter()
                .take(quota - owned)
                .cloned()
                .collect();
        }

        if !rebalance.to_acquire.is_empty() || !rebalance.to_release.is_empty() {
            tracing::debug!(
                worker = %me,
                owned,
                quota,
                total,
                acquire = rebalance.to_acquire.len(),
                release = rebalance.to_release.len(),
                "computed rebalance"
            );
        }
        rebalance
    }
}

impl LoadBalancingStrategy for EqualPartitionsStrategy {
    fn select_leases(&self, all_leases: &[Lease], workers: &[String], me: &str) -> Rebalance {
        self.select_at(Utc::now(), all_leases, workers, me)
    }
}

/// Numeric tokens order numerically, anything else lexically.
fn compare_tokens(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}
