//! Counting service
//!
//! Exposes the counting capability over the broker and publishes its status
//! periodically. The counter starts as soon as the service does.

use cluster_counter::capability::CountingCapability;
use cluster_counter::config::ServiceConfig;
use cluster_counter::logging::init_tracing;
use cluster_counter::runtime::ServiceRuntime;
use cluster_counter::signal::shutdown_signal;
use cluster_counter::transport::mqtt::MqttBroker;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = ServiceConfig::from_env()?;
    let brokers: Vec<String> = config.broker.endpoints.iter().map(ToString::to_string).collect();
    tracing::info!(
        brokers = %brokers.join(","),
        protocol = %config.broker.protocol,
        address = %config.service_address(),
        status_interval_secs = config.status_interval.as_secs_f64(),
        "Starting counting service"
    );

    let broker = MqttBroker::new(config.broker.clone(), config.service_name.as_str())?;
    let capability = CountingCapability::start().await;
    let cancel = CancellationToken::new();
    let run = ServiceRuntime::new(&config, broker, capability).run(cancel.clone());
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result?,
        () = shutdown_signal() => {
            cancel.cancel();
            run.await?;
        }
    }

    tracing::info!("Counting service exited");
    Ok(())
}
