//! Rollout Agent - Entry Point
//!
//! Host-resident agent performing blue-green container rollouts on behalf
//! of a control plane.

use std::collections::HashMap;
use std::env;

use rollout_agent::app::options::AppOptions;
use rollout_agent::app::run::run;
use rollout_agent::logs::{init_logging, LogOptions};
use rollout_agent::storage::layout::StorageLayout;
use rollout_agent::storage::settings::Settings;
use rollout_agent::utils::{run_diagnostic, version_info, SecretToken};

use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Failed to render version: {e}"),
        }
        return;
    }

    let layout = match cli_args.get("base-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file, falling back to defaults when absent
    let settings_file = match cli_args.get("config") {
        Some(path) => rollout_agent::filesys::file::File::new(path),
        None => layout.settings_file(),
    };
    let mut settings = match settings_file.read_json_opt::<Settings>().await {
        Ok(settings) => settings.unwrap_or_default(),
        Err(e) => {
            eprintln!("Unable to read settings file: {e}");
            return;
        }
    };
    apply_env_overrides(&mut settings);

    // Run diagnostics
    if cli_args.contains_key("diagnostic") || cli_args.contains_key("diag") {
        run_diagnostic(&settings.runtime).await;
        return;
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    // Run the agent
    let options = AppOptions::from_settings(settings, layout);
    info!("Running rollout agent {} with options: {:?}", version.version, options);
    let result = run(options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run the agent: {e}");
    }
}

fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(token) = env::var("ROLLOUT_BACKEND_TOKEN") {
        settings.backend.token = Some(SecretToken::new(token));
    }
    if let Ok(token) = env::var("ROLLOUT_ROUTING_TOKEN") {
        settings.routing.token = Some(SecretToken::new(token));
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    warn!("Unable to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
