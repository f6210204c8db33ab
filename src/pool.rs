//! Client connection leases.
//!
//! Actors ask the execution context for a client by pool name and instance
//! index; the context forwards the request to a [`ClientPool`] together with
//! the workload configuration. Connection mechanics belong to the pool.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::config::ConfigNode;
use crate::core::errors::Result;

/// A command about to be sent by a leased client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEvent {
    pub client: String,
    pub instance: usize,
    pub command: String,
}

pub type CommandObserver = Arc<dyn Fn(&CommandEvent) + Send + Sync>;

pub trait ClientPool: Send + Sync {
    fn client(&self, name: &str, instance: usize, workload: &ConfigNode) -> Result<ClientLease>;
}

/// Handle to one client from a named pool.
#[derive(Clone)]
pub struct ClientLease {
    name: String,
    instance: usize,
    uri: String,
    dry_run: bool,
    observer: Option<CommandObserver>,
}

impl ClientLease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> usize {
        self.instance
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Dry-run leases must never open a connection.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn notify_command_start(&self, command: &str) {
        if let Some(observer) = &self.observer {
            observer(&CommandEvent {
                client: self.name.clone(),
                instance: self.instance,
                command: command.to_string(),
            });
        }
    }
}

impl fmt::Debug for ClientLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientLease")
            .field("name", &self.name)
            .field("instance", &self.instance)
            .field("uri", &self.uri)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

/// Default pool: reads `Clients.<name>.URI` from the workload.
pub struct UriPoolManager {
    dry_run: bool,
    observer: Option<CommandObserver>,
    leases: DashMap<(String, usize), usize>,
}

impl UriPoolManager {
    pub fn new(observer: Option<CommandObserver>, dry_run: bool) -> Self {
        Self {
            dry_run,
            observer,
            leases: DashMap::new(),
        }
    }

    /// How many leases have been handed out for one pool instance.
    pub fn lease_count(&self, name: &str, instance: usize) -> usize {
        self.leases
            .get(&(name.to_string(), instance))
            .map(|count| *count)
            .unwrap_or(0)
    }
}

impl ClientPool for UriPoolManager {
    fn client(&self, name: &str, instance: usize, workload: &ConfigNode) -> Result<ClientLease> {
        let uri: String = workload.get("Clients").get(name).get("URI").to()?;

        *self.leases.entry((name.to_string(), instance)).or_insert(0) += 1;
        debug!("Leased client '{}' instance {} ({})", name, instance, uri);

        Ok(ClientLease {
            name: name.to_string(),
            instance,
            uri,
            dry_run: self.dry_run,
            observer: self.observer.clone(),
        })
    }
}
