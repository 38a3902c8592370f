//! cdc-pipeline: replicate a change log into configured sinks.
//!
//! ```text
//! cdc-pipeline            run the pipeline from CDC_CONFIG
//! cdc-pipeline publish    feed the change log into the buffered topic
//! ```
//!
//! Positions and sink destinations live under `CDC_DATA_DIR`.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use cdc_pipeline::clock::ProductionClock;
use cdc_pipeline::observability::{init_tracing, LogFormat};
use cdc_pipeline::pipeline::config::data_dir_from_env;
use cdc_pipeline::pipeline::{PipelineBuilder, PipelineConfig, PipelinePhase};
use cdc_pipeline::source::{FileChangeLog, SharedSource};
use cdc_pipeline::store::{LocalFsObjectStore, SharedStore};
use cdc_pipeline::transport::{Topic, TopicPublisher};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const STATUS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(LogFormat::from_env());

    let config = PipelineConfig::from_env()?;
    let data_dir = data_dir_from_env();
    let state_store: SharedStore = Arc::new(LocalFsObjectStore::new(data_dir.join("state")));
    let sink_store: SharedStore = Arc::new(LocalFsObjectStore::new(data_dir.join("sinks")));

    match std::env::args().nth(1).as_deref() {
        None | Some("run") => run(config, state_store, sink_store).await,
        Some("publish") => publish(config, state_store, sink_store).await,
        Some(other) => Err(format!("unknown command {:?}; expected run or publish", other).into()),
    }
}

async fn run(
    config: PipelineConfig,
    state_store: SharedStore,
    sink_store: SharedStore,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("cdc-pipeline {}", env!("CARGO_PKG_VERSION"));
    println!("  pipeline: {}", config.pipeline_id);
    if config.transport.enabled {
        println!(
            "  source:   topic {} partition {}",
            config.transport.topic, config.transport.partition
        );
    } else {
        println!("  source:   {}", config.source.dir.display());
    }
    for sink in &config.sinks {
        println!("  sink:     {} ({}) at {}", sink.id, sink.kind, sink.store_prefix());
    }
    println!();

    let handle = PipelineBuilder::new(config)
        .state_store(state_store)
        .sink_store(sink_store)
        .start()
        .await?;

    let mut updates = handle.subscribe();
    let mut tick = tokio::time::interval(STATUS_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted; stopping pipeline");
                break;
            }
            _ = tick.tick() => {
                println!("{}", serde_json::to_string(&handle.status())?);
            }
            changed = updates.changed() => {
                if changed.is_err() || updates.borrow().phase.is_terminal() {
                    break;
                }
            }
        }
    }

    let status = handle.status();
    if status.phase == PipelinePhase::Failed {
        error!(reason = ?status.reason, "Pipeline failed");
        println!("{}", serde_json::to_string(&status)?);
        std::process::exit(1);
    }

    let report = handle.stop().await?;
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

async fn publish(
    config: PipelineConfig,
    state_store: SharedStore,
    sink_store: SharedStore,
) -> Result<(), Box<dyn std::error::Error>> {
    let source: SharedSource = Arc::new(FileChangeLog::open(config.source.clone())?);
    let topic = Topic::open(sink_store, &config.transport)?;
    let cancel = CancellationToken::new();

    println!(
        "cdc-pipeline {}: publishing {} into topic {}",
        env!("CARGO_PKG_VERSION"),
        config.source.dir.display(),
        topic.name()
    );

    let publisher = TopicPublisher::start(
        &config,
        source,
        topic,
        state_store,
        ProductionClock::shared(),
        cancel.clone(),
    )
    .await?;
    let task = tokio::spawn(publisher.run());

    tokio::signal::ctrl_c().await?;
    info!("Interrupted; stopping publisher");
    cancel.cancel();
    let stats = task.await??;
    println!(
        "published {} events in {} batches through {:?}",
        stats.published, stats.batches, stats.position
    );
    Ok(())
}
