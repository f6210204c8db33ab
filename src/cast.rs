//! Actor producers, keyed by the `Type` an actor declares.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::context::UnitContext;
use crate::core::errors::{LoadcastError, Result};
use crate::rng::ActorId;

/// A live execution unit.
pub trait Actor: Send {
    fn id(&self) -> ActorId;

    /// Runs the actor's work for the whole workload.
    fn run(&mut self) -> anyhow::Result<()>;
}

/// Builds actors for every unit context that declares its type.
///
/// A producer may return any number of actors for one context (one per
/// configured thread, none at all, ...). Shared resources such as rate
/// limiters and RNGs must be requested here, before the context is sealed.
#[async_trait]
pub trait ActorProducer: Send + Sync {
    fn name(&self) -> &str;

    async fn produce(&self, context: &UnitContext) -> Result<Vec<Box<dyn Actor>>>;
}

type ProduceFn = dyn Fn(&UnitContext) -> Result<Vec<Box<dyn Actor>>> + Send + Sync;

/// Producer backed by a plain function.
pub struct FnProducer {
    name: String,
    produce: Box<ProduceFn>,
}

impl FnProducer {
    pub fn new<F>(name: impl Into<String>, produce: F) -> Self
    where
        F: Fn(&UnitContext) -> Result<Vec<Box<dyn Actor>>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            produce: Box::new(produce),
        }
    }
}

#[async_trait]
impl ActorProducer for FnProducer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn produce(&self, context: &UnitContext) -> Result<Vec<Box<dyn Actor>>> {
        (self.produce)(context)
    }
}

#[derive(Debug, Clone, Error)]
#[error("Unable to construct actors: No producer for '{name}'.\nRegistered producers: {}", .known.join(", "))]
pub struct ProducerNotFound {
    pub name: String,
    pub known: Vec<String>,
}

impl From<ProducerNotFound> for LoadcastError {
    fn from(err: ProducerNotFound) -> Self {
        LoadcastError::configuration_field(err.to_string(), "Type")
    }
}

/// Registry of actor producers
#[derive(Clone)]
pub struct Cast {
    producers: Arc<RwLock<HashMap<String, Arc<dyn ActorProducer>>>>,
}

impl Cast {
    pub fn new() -> Self {
        Self {
            producers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a producer under its own name. Names must be unique.
    pub fn register(&self, producer: Arc<dyn ActorProducer>) -> Result<()> {
        let mut producers = self.producers.write();
        let name = producer.name().to_string();
        if producers.contains_key(&name) {
            return Err(LoadcastError::configuration(format!(
                "Producer '{}' is already registered",
                name
            )));
        }
        info!("Registered producer: {}", name);
        producers.insert(name, producer);
        Ok(())
    }

    pub fn producer(&self, name: &str) -> std::result::Result<Arc<dyn ActorProducer>, ProducerNotFound> {
        let producers = self.producers.read();
        producers.get(name).cloned().ok_or_else(|| ProducerNotFound {
            name: name.to_string(),
            known: sorted_names(&producers),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.producers.read().contains_key(name)
    }

    /// All registered producer names, sorted
    pub fn names(&self) -> Vec<String> {
        sorted_names(&self.producers.read())
    }
}

impl Default for Cast {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_names(producers: &HashMap<String, Arc<dyn ActorProducer>>) -> Vec<String> {
    let mut names: Vec<String> = producers.keys().cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nothing(name: &str) -> Arc<dyn ActorProducer> {
        Arc::new(FnProducer::new(name, |_| Ok(Vec::new())))
    }

    #[test]
    fn test_lookup() {
        let cast = Cast::new();
        cast.register(nothing("Insert")).unwrap();
        assert!(cast.contains("Insert"));
        assert_eq!(cast.producer("Insert").unwrap().name(), "Insert");
    }

    #[test]
    fn test_duplicate_registration() {
        let cast = Cast::new();
        cast.register(nothing("Insert")).unwrap();
        assert!(cast.register(nothing("Insert")).unwrap_err().is_configuration());
    }

    #[test]
    fn test_not_found_lists_known_producers() {
        let cast = Cast::new();
        cast.register(nothing("Update")).unwrap();
        cast.register(nothing("Insert")).unwrap();

        let err = cast.producer("Delete").err().unwrap();
        assert_eq!(err.known, vec!["Insert", "Update"]);

        let err = LoadcastError::from(err);
        assert!(err.is_configuration());
        let message = err.to_string();
        assert!(message.contains("No producer for 'Delete'"));
        assert!(message.contains("Insert"));
        assert!(message.contains("Update"));
    }
}
