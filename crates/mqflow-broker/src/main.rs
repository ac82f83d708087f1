//! mqflow-broker - MQTT 3.1.1 broker binary.

use log::{error, info};

use mqflow_broker::config::DEFAULT_CONFIG_FILE;
use mqflow_broker::{Config, Server};

struct Args {
    config_path: String,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = DEFAULT_CONFIG_FILE.to_string();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                if i + 1 < args.len() {
                    config_path = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("Error: -c requires a file path");
                    std::process::exit(1);
                }
            }
            "-h" | "--help" => {
                println!("mqflow-broker - MQTT 3.1.1 broker");
                println!();
                println!("Usage: mqflow-broker [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <FILE>     Config file path (default: {})", DEFAULT_CONFIG_FILE);
                println!("  -h, --help              Show this help message");
                println!();
                println!("Configuration:");
                println!("  Config file uses TOML format. All settings can be overridden");
                println!("  with environment variables using MQFLOW__ prefix:");
                println!();
                println!("  MQFLOW__SERVER__BIND=0.0.0.0:1884");
                println!("  MQFLOW__SERVER__WORKERS=4");
                println!("  MQFLOW__LIMITS__MAX_QUEUED=5000");
                println!("  MQFLOW__LOG__LEVEL=debug");
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                eprintln!("Use --help for usage information");
                std::process::exit(1);
            }
        }
    }

    Args { config_path }
}

fn main() {
    let args = parse_args();

    let config = match Config::load(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log.level))
        .init();

    info!("Loaded configuration from {}", args.config_path);

    let workers = config.server.worker_threads();
    info!(
        "Starting mqflow with {} worker threads (max_packet_size={}KB, max_inflight={}, max_queued={})",
        workers,
        config.limits.max_packet_size / 1024,
        config.limits.max_inflight,
        config.limits.max_queued
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        let server = Server::bind(config).await?;
        server.run().await
    });

    if let Err(e) = result {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
