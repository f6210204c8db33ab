// Core infrastructure modules
pub mod core {
    pub mod errors;
}

// Workload configuration and its resolved settings
pub mod config;
pub mod metrics;

// Phases and the run cursor that drives them
pub mod orchestrator;
pub mod phase;

// Shared resources handed to actors during construction
pub mod limiter;
pub mod pool;
pub mod rng;

// External phase coordination
pub mod coordinator;

// Producers and the construction pipeline
pub mod cast;
pub mod context;

// Re-exports for convenience
pub use core::errors::{LoadcastError, Result};

pub use cast::{Actor, ActorProducer, Cast, FnProducer, ProducerNotFound};
pub use config::{ConfigNode, ContextOptions};
pub use context::{ExecutionContext, SleepContext, UnitContext, WorkloadResources, SCHEMA_VERSION};
pub use coordinator::{CoordinatorAddress, PhaseCoordinationChannel};
pub use limiter::{GlobalRateLimiter, RateLimiterRegistry, RateSpec};
pub use metrics::{MetricsConfig, MetricsFormat};
pub use orchestrator::{Orchestrator, PhaseObserver};
pub use phase::{expand_phases, PhaseContext, PhaseNumber, PhaseRangeSpec};
pub use pool::{ClientLease, ClientPool, CommandEvent, CommandObserver, UriPoolManager};
pub use rng::{ActorId, RandomSeedRegistry, SharedRng, RNG_SEED_BASE};
