use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::Parser;
use configuration::Settings;
use tracing::{error, info};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

#[derive(Parser, Debug)]
#[command(
    name = "k8s-sidecar",
    about = "Projects labelled ConfigMaps and Secrets onto the local filesystem",
    version
)]
struct Args {
    /// Read the basic-auth username for notifications from this file
    /// (takes precedence over REQ_USERNAME).
    #[arg(long)]
    req_username_file: Option<PathBuf>,
    /// Read the basic-auth password for notifications from this file
    /// (takes precedence over REQ_PASSWORD).
    #[arg(long)]
    req_password_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Args::parse();

    info!("starting collector");

    let mut settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        },
    };
    if let Some(path) = &args.req_username_file {
        settings.request.username = Some(read_credential(path));
    }
    if let Some(path) = &args.req_password_file {
        settings.request.password = Some(read_credential(path));
    }
    let settings = Arc::new(settings);

    let notifier = match engine::build_notifier(&settings) {
        Ok(notifier) => Arc::new(notifier),
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        },
    };

    let client = match engine::build_client(&settings).await {
        Ok(client) => client,
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        },
    };

    let health = Arc::new(engine::HealthState::new());
    tokio::spawn(engine::healthz::serve(health.clone(), settings.health_port));

    if let Err(err) = engine::supervisor::run(settings, client, notifier, health).await {
        error!("{err}");
        std::process::exit(1);
    }
}

fn read_credential(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents.trim_end_matches(['\r', '\n']).to_string(),
        Err(err) => {
            error!("failed to read credential file {}: {err}", path.display());
            std::process::exit(1);
        },
    }
}

fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
