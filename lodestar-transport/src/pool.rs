//! Shared node pool
//!
//! The pool owns the node set as an atomically swapped `Arc` snapshot:
//! `create_view` clones the `Arc` and iterates without holding any lock, so
//! a concurrent `reseed` can never tear a view in half. The startup-sniff
//! gate is the one place requiring real mutual exclusion.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::info;

use crate::error::{Result, TransportError};
use crate::metrics;
use crate::node::Node;

pub struct NodePool {
    nodes: RwLock<Arc<Vec<Arc<Node>>>>,
    last_update: RwLock<Instant>,
    sniffed_on_startup: AtomicBool,
    startup_gate: Semaphore,
    supports_reseeding: bool,
    supports_pinging: bool,
    view_counter: AtomicU64,
}

impl NodePool {
    /// Fixed node set; topology is never updated.
    pub fn static_pool<I, S>(seeds: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::from_nodes(Self::seed_nodes(seeds)?, false, true)
    }

    /// Pool that adopts sniffed topology.
    pub fn sniffing<I, S>(seeds: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::from_nodes(Self::seed_nodes(seeds)?, true, true)
    }

    /// Sniffing pool seeded with pre-built, role-aware nodes.
    pub fn sniffing_from_nodes(nodes: Vec<Node>) -> Result<Self> {
        Self::from_nodes(nodes, true, true)
    }

    /// Static pool seeded with pre-built, role-aware nodes.
    pub fn static_from_nodes(nodes: Vec<Node>) -> Result<Self> {
        Self::from_nodes(nodes, false, true)
    }

    /// One pinned node; no retries, no reseeding, no pinging.
    pub fn single(url: &str) -> Result<Self> {
        Self::from_nodes(vec![Node::new(url)?], false, false)
    }

    fn seed_nodes<I, S>(seeds: I) -> Result<Vec<Node>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        seeds.into_iter().map(|s| Node::new(s.as_ref())).collect()
    }

    fn from_nodes(nodes: Vec<Node>, supports_reseeding: bool, supports_pinging: bool) -> Result<Self> {
        if nodes.is_empty() {
            return Err(TransportError::Config(
                "node pool requires at least one seed node".into(),
            ));
        }
        metrics::record_pool_size(nodes.len());
        Ok(Self {
            nodes: RwLock::new(Arc::new(nodes.into_iter().map(Arc::new).collect())),
            last_update: RwLock::new(Instant::now()),
            sniffed_on_startup: AtomicBool::new(false),
            startup_gate: Semaphore::new(1),
            supports_reseeding,
            supports_pinging,
            view_counter: AtomicU64::new(0),
        })
    }

    /// Consistent snapshot of the current node set.
    pub fn nodes(&self) -> Arc<Vec<Arc<Node>>> {
        Arc::clone(&self.nodes.read())
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn supports_reseeding(&self) -> bool {
        self.supports_reseeding
    }

    pub fn supports_pinging(&self) -> bool {
        self.supports_pinging
    }

    pub fn last_update(&self) -> Instant {
        *self.last_update.read()
    }

    pub fn sniffed_on_startup(&self) -> bool {
        self.sniffed_on_startup.load(Ordering::Acquire)
    }

    pub(crate) fn latch_sniffed_on_startup(&self) {
        self.sniffed_on_startup.store(true, Ordering::Release);
    }

    pub(crate) fn startup_gate(&self) -> &Semaphore {
        &self.startup_gate
    }

    /// Rotation seed for the next view; spreads concurrent callers round-robin.
    pub fn next_view_seed(&self) -> u64 {
        self.view_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Ordered candidates for one selection pass: alive nodes first in
    /// rotated order, then dead nodes whose backoff window has elapsed.
    /// Nodes still inside their window are left out entirely.
    ///
    /// Pure read; never mutates the pool.
    pub fn create_view(&self, seed: u64) -> Vec<Arc<Node>> {
        let snapshot = self.nodes();
        let len = snapshot.len();
        if len == 0 {
            return Vec::new();
        }
        let now = Instant::now();
        let start = (seed % len as u64) as usize;
        let mut view = Vec::with_capacity(len);
        let mut resurrected = Vec::new();
        for i in 0..len {
            let node = &snapshot[(start + i) % len];
            if node.is_alive() {
                view.push(Arc::clone(node));
            } else if node.is_resurrected(now) {
                resurrected.push(Arc::clone(node));
            }
        }
        view.extend(resurrected);
        view
    }

    /// Sniff candidates: cluster-manager-eligible nodes first, ties broken
    /// by ascending port, non-eligible nodes at the end. Never filtered by
    /// the node predicate.
    pub fn sniff_targets(&self) -> Vec<Arc<Node>> {
        let mut targets: Vec<Arc<Node>> = self.nodes().iter().map(Arc::clone).collect();
        targets.sort_by_key(|n| (!n.cluster_manager_eligible(), n.port()));
        targets
    }

    /// Atomically replace the node set with freshly sniffed topology.
    pub fn reseed(&self, nodes: Vec<Node>) {
        let nodes: Vec<Arc<Node>> = nodes.into_iter().map(Arc::new).collect();
        info!(count = nodes.len(), "reseeding node pool from sniffed topology");
        metrics::record_pool_size(nodes.len());
        *self.nodes.write() = Arc::new(nodes);
        *self.last_update.write() = Instant::now();
    }

    /// Pool-level retry cap: at most every other node once.
    pub fn max_retries(&self) -> u32 {
        self.len().saturating_sub(1) as u32
    }
}
