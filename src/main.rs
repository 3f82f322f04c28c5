mod config;
mod discovery;
mod models;
mod mqtt_service;
mod service_utils;
mod topic_tracker;

use crate::config::Config;
use crate::mqtt_service::MqttService;
use crate::service_utils::{handle_shutdown, mqtt_client_id, start_logging};
use crate::topic_tracker::TopicTracker;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::load();

    // Initialize logging
    start_logging(config.as_ref().map(|cfg| cfg.verbose).unwrap_or(false));

    // Load configuration
    let config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(
        "Watching {} lab(s) under '{}' on {}:{}.",
        config.labs, config.root_topic, config.mqtt_host, config.mqtt_port
    );

    let shutdown = CancellationToken::new();
    handle_shutdown(shutdown.clone());

    let mqtt_service = MqttService::new(config, mqtt_client_id());
    let mut tracker = TopicTracker::new();

    match mqtt_service.run(&mut tracker, shutdown).await {
        Ok(()) => {
            info!("Lab watcher shut down cleanly ({} topic(s) tracked).", tracker.len());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Lab watcher stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}
