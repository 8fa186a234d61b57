//! Process-wide port reservations

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::ManagerError;
use crate::storage::records::RecordStore;

pub const MIN_PORT: u16 = 1024;

/// Ports handed out to in-flight attempts.
///
/// The check-and-reserve critical section runs under one async mutex, so two
/// attempts can never both claim a port that no record owns yet.
#[derive(Clone, Default)]
pub struct PortRegistry {
    gate: Arc<Mutex<()>>,
    reserved: Arc<StdMutex<HashMap<u16, String>>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `port` for `domain`.
    ///
    /// Fails when another record owns the port, another attempt holds it, or
    /// (with `check_bind`) something already listens on it.
    pub async fn reserve(
        &self,
        port: u16,
        domain: &str,
        records: &dyn RecordStore,
        check_bind: bool,
    ) -> Result<PortLease, ManagerError> {
        if port < MIN_PORT {
            return Err(ManagerError::ValidationError(format!(
                "Port {} is outside the allowed range {}-65535",
                port, MIN_PORT
            )));
        }

        let _gate = self.gate.lock().await;

        if let Some(owner) = records
            .list()
            .await?
            .into_iter()
            .find(|r| r.port == port && r.domain != domain)
        {
            return Err(ManagerError::ValidationError(format!(
                "Port {} is already used by {}",
                port, owner.domain
            )));
        }

        if let Some(holder) = self.holder(port) {
            if holder != domain {
                return Err(ManagerError::ValidationError(format!(
                    "Port {} is reserved by an in-flight deployment of {}",
                    port, holder
                )));
            }
        }

        if check_bind {
            if let Err(e) = TcpListener::bind(("127.0.0.1", port)).await {
                return Err(ManagerError::ValidationError(format!(
                    "Port {} is already in use on this host: {}",
                    port, e
                )));
            }
        }

        self.lock_reserved().insert(port, domain.to_string());
        debug!("Reserved port {} for {}", port, domain);

        Ok(PortLease {
            port,
            reserved: self.reserved.clone(),
        })
    }

    /// Domain of the in-flight attempt holding `port`
    pub fn holder(&self, port: u16) -> Option<String> {
        self.lock_reserved().get(&port).cloned()
    }

    pub fn reserved_count(&self) -> usize {
        self.lock_reserved().len()
    }

    fn lock_reserved(&self) -> std::sync::MutexGuard<'_, HashMap<u16, String>> {
        self.reserved.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Reservation of a port; released when dropped
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    reserved: Arc<StdMutex<HashMap<u16, String>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.reserved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.port);
    }
}
