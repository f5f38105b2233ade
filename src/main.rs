use clap::Parser;
use log::{error, info};
use std::path::Path;
use ws_recorder::configuration::config::Config;
use ws_recorder::controller::controller_handler::Controller;

#[derive(Parser)]
#[command(name = "ws-recorder")]
#[command(version = "0.1.0")]
#[command(about = "Records WebSocket feeds into per-session SQLite files")]
struct Args {
    config_file: String,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    info!("Importing configuration");

    let args = Args::parse();

    if args.config_file.is_empty() {
        error!("No configuration file found");
        std::process::exit(1);
    }

    let config = match Config::from_file(Path::new(args.config_file.as_str())) {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to import configuration from file: {}", e);
            std::process::exit(1);
        }
    };

    info!("Configuration imported successfully");

    let controller = match Controller::new(config) {
        Ok(controller) => controller,
        Err(e) => {
            error!("Unable to create a controller instance: {}, exiting...", e);
            std::process::exit(1);
        }
    };

    let result = tokio::spawn(async move {
        info!("Spawning the controller");
        if let Err(e) = controller.run().await {
            error!("Error occured in the controller process: {}, exiting...", e);
            std::process::exit(1);
        }
    });

    if let Err(e) = result.await {
        error!("Error joining at the end of execution: {:?}", e);
        std::process::exit(1);
    }
}
