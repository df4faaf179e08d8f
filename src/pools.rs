//! Bounded concurrency gates shared by the sessions of one execution context.
//!
//! Four pools exist because the underlying costs differ: a live SSH connection
//! is cheap to hold but limited by the devices' session limits, commands are
//! cheap to multiplex over one connection, and bulk transfers saturate links.
//! A [`ResourcePools`] value is created once per run and handed to every
//! session through [`crate::session::SessionContext`]; it is never global.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::PoolLimits;

/// A named, capacity-bounded gate.
#[derive(Clone)]
pub struct ResourcePool {
    name: &'static str,
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

impl ResourcePool {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        // A zero-sized pool would block forever.
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }

    /// Waits for a free slot. The slot is released when the permit is dropped.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        // The semaphore is never closed, so acquisition only fails on a bug.
        match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("resource pool {} closed", self.name),
        }
    }

    /// Takes a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// The four pools of one execution context.
#[derive(Debug, Clone)]
pub struct ResourcePools {
    pub connections: ResourcePool,
    pub executions: ResourcePool,
    pub downloads: ResourcePool,
    pub uploads: ResourcePool,
}

impl ResourcePools {
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            connections: ResourcePool::new("connections", limits.connections),
            executions: ResourcePool::new("executions", limits.executions),
            downloads: ResourcePool::new("downloads", limits.downloads),
            uploads: ResourcePool::new("uploads", limits.uploads),
        }
    }

    pub fn limits(&self) -> PoolLimits {
        PoolLimits {
            connections: self.connections.capacity(),
            executions: self.executions.capacity(),
            downloads: self.downloads.capacity(),
            uploads: self.uploads.capacity(),
        }
    }
}

impl Default for ResourcePools {
    fn default() -> Self {
        Self::new(PoolLimits::default())
    }
}
