//! Host selection across the cluster.

use crate::config::LoadBalancingStrategy;
use dbwire_protocol::HostDescription;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks the host serving the next request.
///
/// `None` and `OneRandom` pin one host and keep it while it stays in the
/// topology; `RoundRobin` rotates over every host.
#[derive(Debug)]
pub struct HostSelector {
    strategy: LoadBalancingStrategy,
    cursor: AtomicUsize,
    pinned: Mutex<Option<HostDescription>>,
}

impl HostSelector {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
            pinned: Mutex::new(None),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    /// Selects one of `hosts`, or `None` when the list is empty.
    pub fn select(&self, hosts: &[HostDescription]) -> Option<HostDescription> {
        if hosts.is_empty() {
            return None;
        }

        match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
                Some(hosts[turn % hosts.len()].clone())
            }
            LoadBalancingStrategy::None => self.pin(hosts, |_| 0),
            LoadBalancingStrategy::OneRandom => {
                self.pin(hosts, |len| rand::thread_rng().gen_range(0..len))
            }
        }
    }

    fn pin(
        &self,
        hosts: &[HostDescription],
        pick: impl FnOnce(usize) -> usize,
    ) -> Option<HostDescription> {
        let mut pinned = self.pinned.lock();
        if let Some(host) = pinned.as_ref() {
            if hosts.contains(host) {
                return Some(host.clone());
            }
            tracing::debug!("Pinned host {} left the topology", host);
        }

        let host = hosts[pick(hosts.len())].clone();
        tracing::debug!("Pinning requests to {}", host);
        *pinned = Some(host.clone());
        Some(host)
    }
}
