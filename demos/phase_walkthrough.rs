//! Walks a small workload through its phases.
//!
//! This example shows:
//! - Registering producers and building an execution context from YAML
//! - Actors sharing one rate limiter and drawing from their own RNGs
//! - Driving phase boundaries by hand with the orchestrator

use anyhow::Result;
use loadcast::{
    Actor, ActorId, Cast, ConfigNode, ContextOptions, ExecutionContext, FnProducer,
    GlobalRateLimiter, Orchestrator, PhaseNumber, SharedRng, SleepContext, UnitContext,
};
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WORKLOAD: &str = r#"
SchemaVersion: 2018-07-01
RandomSeed: 2024
Metrics:
  Format: ftdc
Clients:
  Default:
    URI: mongodb://localhost:27017
Actors:
- Name: Writers
  Type: Insert
  Threads: 2
  GlobalRate: 5 per 100 milliseconds
  Phases:
  - Duration: 50 milliseconds
  - Nop: true
  - Phase: 2..3
    Duration: 30 milliseconds
- Name: Reader
  Type: Find
  Phases:
  - Nop: true
  - Duration: 40 milliseconds
"#;

struct Client {
    id: ActorId,
    name: String,
    rng: SharedRng,
    limiter: Option<Arc<GlobalRateLimiter>>,
    orchestrator: Arc<Orchestrator>,
    // Active phases and how long to work in each.
    phases: Vec<(PhaseNumber, Duration)>,
}

impl Actor for Client {
    fn id(&self) -> ActorId {
        self.id
    }

    fn run(&mut self) -> anyhow::Result<()> {
        for (phase, duration) in &self.phases {
            while self.orchestrator.continue_running()
                && self.orchestrator.current_phase() < *phase
            {
                std::thread::sleep(Duration::from_millis(1));
            }
            let deadline = Instant::now() + *duration;
            let mut operations = 0;
            while Instant::now() < deadline {
                let allowed = match &self.limiter {
                    Some(limiter) => limiter.consume_if_within_rate(Instant::now()),
                    None => true,
                };
                if allowed {
                    let _document: u32 = self.rng.lock().gen();
                    operations += 1;
                }
                let sleeper = SleepContext::new(&self.orchestrator, *phase);
                if !sleeper.sleep_for(Duration::from_millis(5)) {
                    break;
                }
            }
            println!("[{}#{}] phase {}: {} operations", self.name, self.id, phase, operations);
        }
        Ok(())
    }
}

fn produce(context: &UnitContext) -> loadcast::Result<Vec<Box<dyn Actor>>> {
    let limiter = context.rate_limiter_from("GlobalRate")?;
    let client = context.client("Default", 0)?;
    println!("{} leases {} (dry run: {})", context.name(), client.uri(), client.is_dry_run());

    let mut phases = Vec::new();
    for (number, phase) in context.phases() {
        if phase.is_nop() {
            continue;
        }
        let raw: String = phase.get("Duration").to()?;
        phases.push((*number, loadcast::limiter::parse_duration(&raw)?));
    }

    let mut actors: Vec<Box<dyn Actor>> = Vec::new();
    for _ in 0..context.threads()? {
        let id = context.next_actor_id();
        actors.push(Box::new(Client {
            id,
            name: context.name().to_string(),
            rng: context.rng(id)?,
            limiter: limiter.clone(),
            orchestrator: context.orchestrator().clone(),
            phases: phases.clone(),
        }));
    }
    Ok(actors)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\n=== Phase walkthrough ===\n");

    let cast = Cast::new();
    cast.register(Arc::new(FnProducer::new("Insert", produce)))?;
    cast.register(Arc::new(FnProducer::new("Find", produce)))?;

    let orchestrator = Arc::new(Orchestrator::new());
    let mut context = ExecutionContext::build(
        ConfigNode::from_yaml_str(WORKLOAD)?,
        orchestrator.clone(),
        &cast,
        ContextOptions::default().with_dry_run(true),
    )
    .await?;

    println!(
        "Built {} actors across phases 0..={} (metrics: {} -> {})",
        context.actors().len(),
        orchestrator.max_phase(),
        context.metrics().format,
        context.metrics().path
    );
    for (phase, active) in context.active_phase_contexts() {
        println!("  phase {}: {} active unit(s)", phase, active.len());
    }

    // Each actor works only inside its own phases; a phase ends once every
    // actor active in it has had the time it asked for.
    let active: BTreeSet<PhaseNumber> = context.active_phase_contexts().keys().copied().collect();
    let mut handles = Vec::new();
    for (_, mut actor) in context.take_actors() {
        handles.push(std::thread::spawn(move || actor.run()));
    }

    for phase in 0..=orchestrator.max_phase() {
        orchestrator.start_phase(phase);
        if active.contains(&phase) {
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        orchestrator.end_phase(phase);
    }
    orchestrator.abort();

    for handle in handles {
        if let Err(e) = handle.join().map_err(|_| anyhow::anyhow!("actor panicked"))? {
            println!("Actor failed: {}", e);
        }
    }

    println!("\n=== Done ===\n");
    Ok(())
}
