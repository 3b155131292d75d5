//! Load-shaped tests: many concurrent enqueues/claims against the
//! in-memory store, and a burst of cascading events through an [`Engine`]
//! to confirm quiescence detection holds up under concurrency, not just in
//! the single-event case the unit tests cover.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{Command, ExecutionMode};
use crate::engine::EngineBuilder;
use crate::job::{CommandRegistry, EnqueueOptions, JobStore, QueueResolver, TaskDefinition};
use crate::machine::Machine;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::worker::{Cancellation, HandlerError, JobMetadata, TaskHandler};
use seesaw_testing::InMemoryJobStore;

struct CountingHandler {
    completed: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler for CountingHandler {
    async fn handle(
        &self,
        _metadata: JobMetadata,
        _cancellation: Cancellation,
        _payload: serde_json::Value,
    ) -> Result<(), HandlerError> {
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn scheduler_drains_a_burst_of_concurrently_enqueued_jobs() {
    const JOB_COUNT: usize = 200;

    let store = Arc::new(InMemoryJobStore::new());
    let completed = Arc::new(AtomicUsize::new(0));
    let catalog = Arc::new(CommandRegistry::new());

    let definition = TaskDefinition::new(
        "stress:count",
        QueueResolver::static_name("stress"),
        Arc::new(CountingHandler {
            completed: completed.clone(),
        }),
    );
    catalog.register(definition.clone()).unwrap();
    catalog.freeze();

    let mut enqueue_handles = Vec::new();
    for i in 0..JOB_COUNT {
        let store = store.clone();
        let definition = definition.clone();
        enqueue_handles.push(tokio::spawn(async move {
            store
                .enqueue(
                    &definition,
                    serde_json::json!({"i": i}),
                    EnqueueOptions::default(),
                )
                .unwrap()
        }));
    }
    for handle in enqueue_handles {
        handle.await.unwrap();
    }
    assert_eq!(store.len(), JOB_COUNT);

    let config = SchedulerConfig {
        poll_interval: Duration::from_millis(5),
        fetch_cooldown: Duration::from_millis(1),
        maintenance_interval: Duration::from_millis(20),
        default_max_workers: 16,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(store.clone(), catalog, config);
    let running = scheduler.start(vec!["stress".to_string()]);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while completed.load(Ordering::SeqCst) < JOB_COUNT && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    running.stop();
    assert_eq!(completed.load(Ordering::SeqCst), JOB_COUNT);
}

#[derive(Debug, Clone)]
enum ChainEvent {
    Start(u32),
    Step(u32),
}

#[derive(Debug, Clone)]
struct ChainCommand(u32);
impl Command for ChainCommand {
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Inline
    }
}

struct ChainMachine;
impl Machine for ChainMachine {
    type Event = ChainEvent;
    type Command = ChainCommand;

    fn decide(&mut self, event: &ChainEvent) -> Option<ChainCommand> {
        match event {
            ChainEvent::Start(n) => Some(ChainCommand(*n)),
            ChainEvent::Step(_) => None,
        }
    }
}

struct ChainEffect;
#[async_trait]
impl crate::effect_impl::Effect<ChainCommand, ()> for ChainEffect {
    type Event = ChainEvent;

    async fn execute(
        &self,
        cmd: ChainCommand,
        _ctx: crate::effect_impl::EffectContext<()>,
    ) -> anyhow::Result<ChainEvent> {
        Ok(ChainEvent::Step(cmd.0))
    }
}

#[tokio::test]
async fn engine_quiescence_holds_under_a_burst_of_independent_chains() {
    let engine = EngineBuilder::<ChainEvent, ChainCommand, ()>::new(())
        .with_machine(ChainMachine)
        .with_effect::<ChainCommand, _>(ChainEffect)
        .start();

    let handle = engine.handle();
    let mut waiters = Vec::new();
    for n in 0..50u32 {
        let handle = handle.clone();
        waiters.push(tokio::spawn(async move {
            handle.emit_and_await(ChainEvent::Start(n)).await
        }));
    }

    for waiter in waiters {
        waiter.await.unwrap().expect("each chain settles within the timeout");
    }

    engine.stop();
}
