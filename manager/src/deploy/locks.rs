//! Per-domain attempt locks

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::errors::ManagerError;

/// Domains with an attempt in flight
#[derive(Debug, Clone, Default)]
pub struct DomainLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl DomainLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock of `domain` without waiting
    pub fn try_acquire(&self, domain: &str) -> Result<DomainGuard, ManagerError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(domain.to_string()) {
            return Err(ManagerError::AttemptInProgress(domain.to_string()));
        }
        Ok(DomainGuard {
            domain: domain.to_string(),
            held: self.held.clone(),
        })
    }

    pub fn is_held(&self, domain: &str) -> bool {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).contains(domain)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Releases the domain lock when dropped
#[derive(Debug)]
pub struct DomainGuard {
    domain: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl Drop for DomainGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.domain);
    }
}
