//! Execution and unit contexts.
//!
//! [`ExecutionContext::build`] turns a workload configuration into a set of
//! live actors:
//!
//! 1. check `SchemaVersion`;
//! 2. resolve metrics settings and the random seed;
//! 3. build one [`UnitContext`] per entry in `Actors`, expanding its phases;
//! 4. run the producer for every unit concurrently and merge what they return;
//! 5. register the rate-limiter registry and the coordination channel as
//!    phase observers;
//! 6. seal the shared registries.
//!
//! Any configuration problem fails the whole build before a single actor
//! runs.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::cast::{Actor, Cast};
use crate::config::{ConfigNode, ContextOptions};
use crate::coordinator::{CoordinatorAddress, PhaseCoordinationChannel};
use crate::core::errors::{LoadcastError, Result};
use crate::limiter::{GlobalRateLimiter, RateLimiterRegistry, RateSpec};
use crate::metrics::MetricsConfig;
use crate::orchestrator::Orchestrator;
use crate::phase::{expand_phases, PhaseContext, PhaseNumber};
use crate::pool::{ClientLease, ClientPool, UriPoolManager};
use crate::rng::{ActorId, RandomSeedRegistry, SharedRng, RNG_SEED_BASE};

/// The only workload schema this crate understands.
pub const SCHEMA_VERSION: &str = "2018-07-01";

const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Shared state every unit context and producer can reach.
///
/// Rate limiters and RNGs may only be created until the context is sealed
/// at the end of [`ExecutionContext::build`].
pub struct WorkloadResources {
    workload: ConfigNode,
    orchestrator: Arc<Orchestrator>,
    rate_limiters: Arc<RateLimiterRegistry>,
    rngs: RandomSeedRegistry,
    pool: Arc<dyn ClientPool>,
    next_actor_id: AtomicU64,
    done: AtomicBool,
}

impl WorkloadResources {
    fn new(
        workload: ConfigNode,
        orchestrator: Arc<Orchestrator>,
        seed: u64,
        pool: Arc<dyn ClientPool>,
    ) -> Self {
        Self {
            workload,
            orchestrator,
            rate_limiters: Arc::new(RateLimiterRegistry::new()),
            rngs: RandomSeedRegistry::new(seed),
            pool,
            next_actor_id: AtomicU64::new(1),
            done: AtomicBool::new(false),
        }
    }

    pub fn workload(&self) -> &ConfigNode {
        &self.workload
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn rate_limiter(&self, name: &str, spec: RateSpec) -> Result<Arc<GlobalRateLimiter>> {
        self.rate_limiters.acquire(name, spec)
    }

    pub fn rng(&self, id: ActorId) -> Result<SharedRng> {
        self.rngs.rng_for(id)
    }

    /// Hands out actor ids 1, 2, 3, ... across the whole workload.
    pub fn next_actor_id(&self) -> ActorId {
        self.next_actor_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn client(&self, name: &str, instance: usize) -> Result<ClientLease> {
        self.pool.client(name, instance, &self.workload)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn seal(&self) {
        self.rate_limiters.seal();
        self.rngs.seal();
        self.done.store(true, Ordering::SeqCst);
    }
}

/// Sleeps on behalf of an actor without outliving its phase.
pub struct SleepContext<'a> {
    orchestrator: &'a Orchestrator,
    phase: PhaseNumber,
}

impl<'a> SleepContext<'a> {
    pub fn new(orchestrator: &'a Orchestrator, phase: PhaseNumber) -> Self {
        Self {
            orchestrator,
            phase,
        }
    }

    /// Sleeps for `duration`, returning early once the run stops or moves
    /// off this phase. Returns true if the full duration elapsed.
    pub fn sleep_for(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if !self.orchestrator.continue_running()
                || self.orchestrator.current_phase() != self.phase
            {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Configuration and resources for one declared actor.
pub struct UnitContext {
    node: ConfigNode,
    index: usize,
    name: String,
    actor_type: String,
    phases: BTreeMap<PhaseNumber, PhaseContext>,
    resources: Arc<WorkloadResources>,
}

impl UnitContext {
    fn new(node: ConfigNode, index: usize, resources: Arc<WorkloadResources>) -> Result<Self> {
        let actor_type: String = node.get("Type").to()?;
        let name = node
            .get("Name")
            .maybe::<String>()?
            .unwrap_or_else(|| format!("{}.{}", actor_type, index));
        let phases = expand_phases(&node.get("Phases"), resources.orchestrator())?;
        debug!("Unit '{}' takes part in phases {:?}", name, phases.keys());

        Ok(Self {
            node,
            index,
            name,
            actor_type,
            phases,
            resources,
        })
    }

    pub fn node(&self) -> &ConfigNode {
        &self.node
    }

    pub fn get(&self, key: &str) -> ConfigNode {
        self.node.get(key)
    }

    /// Position in the workload's `Actors` list.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actor_type(&self) -> &str {
        &self.actor_type
    }

    /// `Threads`, defaulting to 1.
    pub fn threads(&self) -> Result<usize> {
        Ok(self.node.get("Threads").maybe::<usize>()?.unwrap_or(1))
    }

    pub fn phases(&self) -> &BTreeMap<PhaseNumber, PhaseContext> {
        &self.phases
    }

    pub fn phase(&self, phase: PhaseNumber) -> Option<&PhaseContext> {
        self.phases.get(&phase)
    }

    pub fn workload(&self) -> &ConfigNode {
        self.resources.workload()
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        self.resources.orchestrator()
    }

    pub fn resources(&self) -> &Arc<WorkloadResources> {
        &self.resources
    }

    pub fn rate_limiter(&self, name: &str, spec: RateSpec) -> Result<Arc<GlobalRateLimiter>> {
        self.resources.rate_limiter(name, spec)
    }

    /// Builds a limiter from the unit's own `key` (e.g. `GlobalRate`), named
    /// after the unit. Returns `None` when the key is absent.
    pub fn rate_limiter_from(&self, key: &str) -> Result<Option<Arc<GlobalRateLimiter>>> {
        let node = self.node.get(key);
        if !node.exists() || node.is_null() {
            return Ok(None);
        }
        let spec = RateSpec::from_node(&node)?;
        self.rate_limiter(&self.name, spec).map(Some)
    }

    pub fn rng(&self, id: ActorId) -> Result<SharedRng> {
        self.resources.rng(id)
    }

    pub fn next_actor_id(&self) -> ActorId {
        self.resources.next_actor_id()
    }

    pub fn client(&self, name: &str, instance: usize) -> Result<ClientLease> {
        self.resources.client(name, instance)
    }

    pub fn sleep_for(&self, phase: PhaseNumber, duration: Duration) -> bool {
        SleepContext::new(self.orchestrator(), phase).sleep_for(duration)
    }
}

/// Everything a running workload needs, built once from its configuration.
pub struct ExecutionContext {
    schema_version: String,
    metrics: MetricsConfig,
    seed: u64,
    units: Vec<Arc<UnitContext>>,
    actors: BTreeMap<ActorId, Box<dyn Actor>>,
    coordinator: Arc<PhaseCoordinationChannel>,
    resources: Arc<WorkloadResources>,
}

impl ExecutionContext {
    pub async fn build(
        workload: ConfigNode,
        orchestrator: Arc<Orchestrator>,
        cast: &Cast,
        options: ContextOptions,
    ) -> Result<Self> {
        options.validate()?;

        let schema_version: String = workload.get("SchemaVersion").to()?;
        if schema_version != SCHEMA_VERSION {
            return Err(LoadcastError::configuration_field(
                format!("Invalid Schema Version: {}", schema_version),
                "SchemaVersion",
            ));
        }

        let metrics = MetricsConfig::from_node(&workload.get("Metrics"))?;
        let seed = read_seed(&workload.get("RandomSeed"))?;

        let pool: Arc<dyn ClientPool> = match options.client_pool.clone() {
            Some(pool) => pool,
            None => Arc::new(UriPoolManager::new(
                options.command_observer.clone(),
                options.dry_run,
            )),
        };
        let resources = Arc::new(WorkloadResources::new(
            workload.clone(),
            orchestrator.clone(),
            seed,
            pool,
        ));

        let units = build_units(&workload.get("Actors"), &resources)?;
        let actors = construct_actors(cast, &units, options.max_parallel_construction).await?;

        let address = match options.coordinator.clone() {
            Some(address) => Some(address),
            None => workload
                .get("ExternalPhaseCoordinator")
                .maybe::<CoordinatorAddress>()?,
        };
        let coordinator = Arc::new(match address {
            Some(address) => {
                tokio::task::spawn_blocking(move || PhaseCoordinationChannel::connect(address))
                    .await?
            }
            None => PhaseCoordinationChannel::disabled(),
        });

        orchestrator.add_observer(resources.rate_limiters.clone());
        orchestrator.add_observer(coordinator.clone());

        resources.seal();
        info!(
            "Workload context ready: {} units, {} actors, {} rate limiters, seed {}",
            units.len(),
            actors.len(),
            resources.rate_limiters.len(),
            seed
        );

        Ok(Self {
            schema_version,
            metrics,
            seed,
            units,
            actors,
            coordinator,
            resources,
        })
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    pub fn metrics(&self) -> &MetricsConfig {
        &self.metrics
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn workload(&self) -> &ConfigNode {
        self.resources.workload()
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        self.resources.orchestrator()
    }

    pub fn units(&self) -> &[Arc<UnitContext>] {
        &self.units
    }

    pub fn actors(&self) -> &BTreeMap<ActorId, Box<dyn Actor>> {
        &self.actors
    }

    pub fn actors_mut(&mut self) -> &mut BTreeMap<ActorId, Box<dyn Actor>> {
        &mut self.actors
    }

    /// Moves the actors out, e.g. to hand each one to its own thread.
    pub fn take_actors(&mut self) -> BTreeMap<ActorId, Box<dyn Actor>> {
        std::mem::take(&mut self.actors)
    }

    pub fn coordinator(&self) -> &PhaseCoordinationChannel {
        &self.coordinator
    }

    pub fn rate_limiters(&self) -> &RateLimiterRegistry {
        &self.resources.rate_limiters
    }

    /// Registries are sealed once built, so this reports a logic error.
    pub fn rate_limiter(&self, name: &str, spec: RateSpec) -> Result<Arc<GlobalRateLimiter>> {
        self.resources.rate_limiter(name, spec)
    }

    pub fn rng(&self, id: ActorId) -> Result<SharedRng> {
        self.resources.rng(id)
    }

    pub fn next_actor_id(&self) -> ActorId {
        self.resources.next_actor_id()
    }

    pub fn client(&self, name: &str, instance: usize) -> Result<ClientLease> {
        self.resources.client(name, instance)
    }

    pub fn is_done(&self) -> bool {
        self.resources.is_done()
    }

    /// Every non-nop phase across all units, grouped by phase number.
    pub fn active_phase_contexts(&self) -> BTreeMap<PhaseNumber, Vec<&PhaseContext>> {
        let mut phases: BTreeMap<PhaseNumber, Vec<&PhaseContext>> = BTreeMap::new();
        for unit in &self.units {
            for (number, phase) in unit.phases() {
                if !phase.is_nop() {
                    phases.entry(*number).or_default().push(phase);
                }
            }
        }
        phases
    }
}

/// `RandomSeed` as an unsigned value; negative seeds keep their bit pattern.
fn read_seed(node: &ConfigNode) -> Result<u64> {
    if let Ok(Some(seed)) = node.maybe::<u64>() {
        return Ok(seed);
    }
    Ok(node
        .maybe::<i64>()?
        .map(|seed| seed as u64)
        .unwrap_or(RNG_SEED_BASE))
}

fn build_units(
    actors: &ConfigNode,
    resources: &Arc<WorkloadResources>,
) -> Result<Vec<Arc<UnitContext>>> {
    let is_list = matches!(
        actors.value(),
        None | Some(serde_yaml::Value::Null)
            | Some(serde_yaml::Value::Sequence(_))
            | Some(serde_yaml::Value::Mapping(_))
    );
    if !is_list {
        return Err(LoadcastError::configuration_field(
            "'Actors' must be a list of actor declarations",
            "Actors",
        ));
    }

    actors
        .entries()
        .into_iter()
        .enumerate()
        .map(|(index, (_, node))| {
            UnitContext::new(node, index, resources.clone()).map(Arc::new)
        })
        .collect()
}

/// One task per unit; every task returns its actors and the results are
/// merged here once they arrive.
async fn construct_actors(
    cast: &Cast,
    units: &[Arc<UnitContext>],
    max_parallel: usize,
) -> Result<BTreeMap<ActorId, Box<dyn Actor>>> {
    // Every producer is resolved before the first task starts, so an unknown
    // type never leaves earlier producers running against a failed build.
    let producers = units
        .iter()
        .map(|unit| -> Result<_> {
            Ok((cast.producer(unit.actor_type())?, unit.clone()))
        })
        .collect::<Result<Vec<_>>>()?;

    let semaphore = Arc::new(Semaphore::new(max_parallel));
    let mut tasks = FuturesUnordered::new();

    for (producer, unit) in producers {
        let semaphore = semaphore.clone();

        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.map_err(|e| LoadcastError::Join {
                message: e.to_string(),
            })?;
            debug!("Constructing actors for unit '{}'", unit.name());
            let actors = producer.produce(&unit).await?;
            Ok::<_, LoadcastError>((unit.name().to_string(), actors))
        }));
    }

    let mut merged = BTreeMap::new();
    while let Some(joined) = tasks.next().await {
        let produced = joined.map_err(LoadcastError::from).and_then(|result| result);
        let (unit_name, actors) = match produced {
            Ok(produced) => produced,
            Err(e) => {
                for task in tasks.iter() {
                    task.abort();
                }
                return Err(e);
            }
        };

        debug!("Unit '{}' produced {} actors", unit_name, actors.len());
        for actor in actors {
            let id = actor.id();
            if merged.insert(id, actor).is_some() {
                for task in tasks.iter() {
                    task.abort();
                }
                return Err(LoadcastError::logic(format!(
                    "Duplicate actor id {} produced by unit '{}'",
                    id, unit_name
                )));
            }
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_returns_early_when_phase_moves_on() {
        let orchestrator = Orchestrator::new();
        orchestrator.start_phase(1);
        let sleeper = SleepContext::new(&orchestrator, 0);
        let start = Instant::now();
        assert!(!sleeper.sleep_for(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_sleep_returns_early_when_aborted() {
        let orchestrator = Orchestrator::new();
        orchestrator.abort();
        assert!(!SleepContext::new(&orchestrator, 0).sleep_for(Duration::from_secs(5)));
    }

    #[test]
    fn test_sleep_runs_full_duration_in_phase() {
        let orchestrator = Orchestrator::new();
        orchestrator.start_phase(2);
        let start = Instant::now();
        assert!(SleepContext::new(&orchestrator, 2).sleep_for(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_seed_accepts_full_unsigned_range() {
        let seed = |yaml: &str| {
            let root = ConfigNode::from_yaml_str(yaml).unwrap();
            read_seed(&root.get("RandomSeed"))
        };
        assert_eq!(seed("RandomSeed: 18446744073709551615").unwrap(), u64::MAX);
        assert_eq!(seed("RandomSeed: -1").unwrap(), u64::MAX);
        assert_eq!(seed("RandomSeed: 42").unwrap(), 42);
        assert_eq!(seed("Other: 1").unwrap(), RNG_SEED_BASE);
        assert!(seed("RandomSeed: lots").unwrap_err().is_configuration());
    }

    #[test]
    fn test_actor_ids_start_at_one() {
        let resources = WorkloadResources::new(
            ConfigNode::from_yaml_str("{}").unwrap(),
            Arc::new(Orchestrator::new()),
            RNG_SEED_BASE,
            Arc::new(UriPoolManager::new(None, true)),
        );
        assert_eq!(resources.next_actor_id(), 1);
        assert_eq!(resources.next_actor_id(), 2);
    }

    #[test]
    fn test_seal_closes_both_registries() {
        let resources = WorkloadResources::new(
            ConfigNode::from_yaml_str("{}").unwrap(),
            Arc::new(Orchestrator::new()),
            1,
            Arc::new(UriPoolManager::new(None, true)),
        );
        let spec = RateSpec::new(1, Duration::from_secs(1)).unwrap();
        assert!(resources.rate_limiter("a", spec).is_ok());
        assert!(resources.rng(1).is_ok());

        resources.seal();
        assert!(resources.is_done());
        assert!(resources.rate_limiter("a", spec).unwrap_err().is_logic());
        assert!(resources.rng(1).unwrap_err().is_logic());
    }
}
