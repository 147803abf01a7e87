use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use futures::future::try_join_all;
use rescore::{
    config::{self, LoadError, Settings, SimulateArgs},
    resource::{
        ALL, BoxError, CachedResource, ConsumerId, FnLoader, ResourceAliases, ResourceConfig,
        ResourceError, ResourceKey,
    },
    task::{Task, TaskError, TaskScheduler, while_task},
    telemetry::{self, TelemetryError},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum RunError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("failed to encode summary: {0}")]
    Output(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct SimulationSummary {
    consumers: usize,
    keys: u32,
    requests: usize,
    loader_calls: usize,
    keys_loaded: usize,
    outdated_rounds: usize,
    elapsed_ms: u128,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_error(&error);
        process::exit(1);
    }
}

fn report_error(error: &RunError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "rescore failed");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "rescore failed");
    });
}

async fn run() -> Result<(), RunError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Simulate(SimulateArgs::default()));

    match command {
        config::Command::Simulate(args) => run_simulate(settings, args).await,
    }
}

async fn run_simulate(settings: Settings, args: SimulateArgs) -> Result<(), RunError> {
    let started = Instant::now();
    let key_count = args.keys.max(1);
    let latency = Duration::from_millis(args.latency_ms);
    let loader_calls = Arc::new(AtomicUsize::new(0));

    let calls = Arc::clone(&loader_calls);
    let loader = FnLoader::new(move |keys: Vec<u32>| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(latency).await;
            Ok::<_, BoxError>(
                keys.into_iter()
                    .map(|key| (key, format!("entity-{key}")))
                    .collect(),
            )
        }
    });
    let aliases =
        ResourceAliases::new().add(ALL.name(), move |_| ResourceKey::list(0..key_count));
    let resource: CachedResource<u32, String> = CachedResource::new(
        "simulated",
        loader,
        aliases,
        ResourceConfig::from(&settings.resource),
    );

    info!(
        consumers = args.consumers,
        keys = key_count,
        requests = args.requests,
        latency_ms = args.latency_ms,
        "Starting simulation"
    );

    let invalidations: TaskScheduler<&'static str> = TaskScheduler::new("invalidation");
    let outdated_rounds = Arc::new(AtomicUsize::new(0));
    let consumers: Vec<Task<usize>> = (0..args.consumers)
        .map(|index| {
            spawn_consumer(
                resource.clone(),
                invalidations.clone(),
                Arc::clone(&outdated_rounds),
                index,
                key_count,
                &args,
            )
        })
        .collect();

    let served: usize = try_join_all(consumers.iter().map(Task::wait))
        .await?
        .into_iter()
        .sum();

    let probe = resource.clone();
    let settled = while_task(
        |idle: &bool| *idle,
        move || {
            let idle = (0..key_count).all(|key| !probe.is_loading(&key));
            Task::resolved(idle)
        },
        settings.task.poll_interval,
        settings.task.poll_timeout,
    );
    settled.wait().await?;

    let summary = SimulationSummary {
        consumers: args.consumers,
        keys: key_count,
        requests: served,
        loader_calls: loader_calls.load(Ordering::SeqCst),
        keys_loaded: resource.len(),
        outdated_rounds: outdated_rounds.load(Ordering::SeqCst),
        elapsed_ms: started.elapsed().as_millis(),
    };
    info!(
        loader_calls = summary.loader_calls,
        requests = summary.requests,
        "Simulation finished"
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn spawn_consumer(
    resource: CachedResource<u32, String>,
    invalidations: TaskScheduler<&'static str>,
    outdated_rounds: Arc<AtomicUsize>,
    index: usize,
    key_count: u32,
    args: &SimulateArgs,
) -> Task<usize> {
    let requests = args.requests;
    let outdate_every = args.outdate_every;
    Task::from_future(async move {
        let consumer = ConsumerId::new();
        let mut served = 0;
        for request in 0..requests {
            let key = ((index * 31 + request * 17) % key_count as usize) as u32;
            let token = resource.use_key(key, consumer);
            resource.load_one(key).await?;
            resource.release(&token);
            served += 1;

            if outdate_every > 0 && (request + 1) % outdate_every == 0 {
                let target = resource.clone();
                let rounds = Arc::clone(&outdated_rounds);
                invalidations
                    .schedule("all", move |_| async move {
                        target.mark_outdated(ResourceKey::alias(ALL)).await?;
                        rounds.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, TaskError>(())
                    })
                    .wait()
                    .await?;
            }
        }
        Ok::<_, TaskError>(served)
    })
}
