//! birdnet-runner - queue worker entry point

use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use birdnet_runner::analyzer::{self, AnalyzerCache, ArtifactFetcher};
use birdnet_runner::pipeline::Pipeline;
use birdnet_runner::queue::{self, QueueClient};
use birdnet_runner::storage::{BucketStores, ObjectStorage};
use birdnet_runner::worker::{SystemHost, Worker};
use birdnet_runner::{Args, Config, init_logging};
use clap::Parser;
use log::info;

fn main() {
    dotenv::dotenv().ok();
    let args = Args::parse();

    init_logging(args.verbose);

    if let Err(e) = run(args) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    if let Some(path) = &args.write_default_config {
        Config::create_default_config(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Default configuration written to {}", path.display());
        return Ok(());
    }

    let config = Config::from_args_and_config(&args).context("Invalid configuration")?;

    if args.check_config {
        println!("{}", birdnet_runner::get_library_info());
        println!("Endpoint: {}", config.api.endpoint);
        println!("Scratch: {}", config.worker.scratch_dir.display());
        println!("Config OK");
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(serve(config, args.instance_metadata))
}

async fn serve(mut config: Config, instance_metadata: bool) -> anyhow::Result<()> {
    let factory = analyzer::default_factory(&config.classifier)?;

    if instance_metadata {
        let metadata_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to create metadata client")?;
        let metadata =
            queue::fetch_instance_metadata(&metadata_client, queue::INSTANCE_METADATA_URL);
        let (instance_id, instance_type) = metadata
            .await
            .context("Failed to read instance metadata")?;
        config.api.processor_id.get_or_insert(instance_id);
        config.api.processor_type.get_or_insert(instance_type);
    }

    let scratch = [
        config.audio_dir(),
        config.clip_dir(),
        config.spectrogram_dir(),
        config.model_cache_dir(),
    ];
    for dir in scratch {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let client = queue::build_http_client(&config.api)?;
    let artifacts =
        ArtifactFetcher::new(client.clone(), &config.api.endpoint, config.model_cache_dir())?;
    let cache = AnalyzerCache::new(factory, Some(artifacts));
    let queue = QueueClient::new(client, &config.api.endpoint, config.identity());
    let storage: Arc<dyn ObjectStorage> = Arc::new(BucketStores::s3(&config.storage));

    info!(
        "{} v{} polling {} as {} ({})",
        birdnet_runner::NAME,
        birdnet_runner::VERSION,
        queue.endpoint(),
        queue.identity().instance_id(),
        queue.identity().instance_type()
    );

    let pipeline = Pipeline::new(queue, storage, cache, &config);
    let host = Box::new(SystemHost::new(config.worker.shutdown_command.clone()));
    let worker = Worker::new(pipeline, host, &config.worker);

    worker.run().await;
    info!("Worker stopped");
    Ok(())
}
