//! Host selection and failover
//!
//! Unpinned requests go to the current host. After `failover_threshold`
//! consecutive connection failures against it, the resolver moves on to
//! the next known host. Pinned requests bypass the resolver entirely and
//! never count towards failover.

use crate::config::{HostDescription, LoadBalancing};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tracing::{info, warn};

pub struct HostResolver {
    hosts: RwLock<Vec<HostDescription>>,
    current: AtomicUsize,
    failures: AtomicU32,
    strategy: LoadBalancing,
    threshold: u32,
}

impl HostResolver {
    pub fn new(hosts: Vec<HostDescription>, strategy: LoadBalancing, threshold: u32) -> Self {
        Self {
            hosts: RwLock::new(hosts),
            current: AtomicUsize::new(0),
            failures: AtomicU32::new(0),
            strategy,
            threshold: threshold.max(1),
        }
    }

    /// Host for the next unpinned request
    ///
    /// Returns `None` only when no host is known.
    pub fn select(&self) -> Option<HostDescription> {
        let hosts = self.hosts.read();
        if hosts.is_empty() {
            return None;
        }
        let index = match self.strategy {
            LoadBalancing::None => self.current.load(Ordering::SeqCst),
            LoadBalancing::RoundRobin => self.current.fetch_add(1, Ordering::SeqCst),
        };
        Some(hosts[index % hosts.len()].clone())
    }

    pub fn current(&self) -> Option<HostDescription> {
        let hosts = self.hosts.read();
        if hosts.is_empty() {
            return None;
        }
        Some(hosts[self.current.load(Ordering::SeqCst) % hosts.len()].clone())
    }

    pub fn hosts(&self) -> Vec<HostDescription> {
        self.hosts.read().clone()
    }

    /// Count a connection failure against `host`
    ///
    /// Only failures against the current host count; round robin rotates
    /// on its own and never fails over.
    pub fn report_failure(&self, host: &HostDescription) {
        if self.strategy == LoadBalancing::RoundRobin {
            return;
        }
        let hosts = self.hosts.read();
        if hosts.len() < 2 {
            return;
        }
        let index = self.current.load(Ordering::SeqCst) % hosts.len();
        if hosts[index] != *host {
            return;
        }

        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.threshold {
            let next = (index + 1) % hosts.len();
            if self
                .current
                .compare_exchange(index, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.failures.store(0, Ordering::SeqCst);
                warn!(from = %host, to = %hosts[next], failures, "Failing over to next host");
            }
        }
    }

    pub fn report_success(&self, host: &HostDescription) {
        if self.current().as_ref() == Some(host) {
            self.failures.store(0, Ordering::SeqCst);
        }
    }

    /// Merge newly discovered hosts; known hosts are never removed
    pub fn add_hosts(&self, discovered: impl IntoIterator<Item = HostDescription>) -> usize {
        let mut hosts = self.hosts.write();
        let mut added = 0;
        for host in discovered {
            if !hosts.contains(&host) {
                info!(host = %host, "Discovered host");
                hosts.push(host);
                added += 1;
            }
        }
        added
    }
}
