//! Worker pool for relay instances.
//!
//! The pool has `min(cpu_count, instance_count)` workers. Instances are dealt
//! out round-robin; a worker that owns several instances takes turns between
//! them so every instance keeps running.

use std::time::Duration;

use tracing::{error, info};

use crate::relay::RelayInstance;

/// Readiness wait per instance when a worker drives more than one.
pub const SHARED_SLICE: Duration = Duration::from_millis(10);

/// Number of workers for `instances` relays on `cpus` cores.
pub fn worker_count(cpus: usize, instances: usize) -> usize {
    cpus.max(1).min(instances)
}

/// [`worker_count`] for this machine.
pub fn default_worker_count(instances: usize) -> usize {
    worker_count(num_cpus::get(), instances)
}

/// Spread `instances` over at most `workers` workers.
pub fn distribute(instances: Vec<RelayInstance>, workers: usize) -> Vec<Worker> {
    let workers = workers.max(1).min(instances.len());
    let mut pool: Vec<Worker> = (0..workers)
        .map(|id| Worker {
            id,
            instances: Vec::new(),
        })
        .collect();

    for (index, instance) in instances.into_iter().enumerate() {
        pool[index % workers].instances.push(instance);
    }
    pool
}

/// A thread's share of the relay instances.
pub struct Worker {
    id: usize,
    instances: Vec<RelayInstance>,
}

impl Worker {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of relay instances this worker drives.
    pub fn relay_count(&self) -> usize {
        self.instances.len()
    }

    /// Drive the instances until every one of them has failed.
    pub fn run(mut self) {
        info!(
            "Worker {} driving {} relay(s)",
            self.id,
            self.instances.len()
        );

        if self.instances.len() == 1 {
            if let Some(instance) = self.instances.pop() {
                let local_addr = instance.local_addr();
                if let Err(e) = instance.run() {
                    error!("Relay on {} failed: {}", local_addr, e);
                }
            }
        }

        while !self.instances.is_empty() {
            let mut index = 0;
            while index < self.instances.len() {
                match self.instances[index].turn(Some(SHARED_SLICE)) {
                    Ok(()) => index += 1,
                    Err(e) => {
                        let instance = self.instances.swap_remove(index);
                        error!("Relay on {} failed: {}", instance.local_addr(), e);
                        instance.close();
                    }
                }
            }
        }

        info!("Worker {} has no relays left", self.id);
    }
}
