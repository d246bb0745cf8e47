//! Counting client
//!
//! Starts the service's counter and polls it for the current count, riding
//! out broker node failures by reconnecting to another node.

use cluster_counter::config::ClientConfig;
use cluster_counter::logging::init_tracing;
use cluster_counter::runtime::ClientRuntime;
use cluster_counter::signal::shutdown_signal;
use cluster_counter::transport::mqtt::MqttBroker;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = ClientConfig::from_env()?;
    let brokers: Vec<String> = config.broker.endpoints.iter().map(ToString::to_string).collect();
    tracing::info!(
        brokers = %brokers.join(","),
        protocol = %config.broker.protocol,
        service = %config.service_address(),
        stale_threshold_secs = config.stale_threshold.as_secs_f64(),
        "Starting counting client"
    );

    let broker = MqttBroker::new(config.broker.clone(), config.client_name.as_str())?;
    let cancel = CancellationToken::new();
    let run = ClientRuntime::new(&config, broker).run(cancel.clone());
    tokio::pin!(run);

    let state = tokio::select! {
        result = &mut run => result?,
        () = shutdown_signal() => {
            cancel.cancel();
            run.await?
        }
    };

    tracing::info!(last_count = ?state.last_count, polling = state.is_polling(), "Counting client exited");
    Ok(())
}
