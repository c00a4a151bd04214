use kube::Client;
use log::{error, info, warn};
use session_controller::config::Config;
use session_controller::errors::*;
use session_controller::manager::Manager;

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(err) = run().await {
        error!("failed to start: {}", err);
        for cause in err.iter().skip(1) {
            error!("caused by: {}", cause);
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Read the environment to find config for kube client.
    // Note that this tries an in-cluster configuration first,
    // then falls back on a kubeconfig file.
    let client = Client::try_default().await?;
    let config = Config::from_env();
    info!(
        "starting session controller (ingress: {}, culling: {})",
        config.use_ingress, config.enable_culling
    );

    let (_manager, drainer) = Manager::new(client, config).await?;

    tokio::select! {
        _ = drainer => warn!("work queue drained; shutting down"),
        _ = tokio::signal::ctrl_c() => info!("interrupt received; shutting down"),
    }
    Ok(())
}
