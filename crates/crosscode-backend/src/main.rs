use crosscode_backend::{simulated_backend, BridgeSvc, SimConfig};
use crosscode_proto::crosscode::v1::bridge_service_server::BridgeServiceServer;
use crosscode_util::{BACKEND_ADDR_ENV, DEFAULT_BACKEND_ADDR};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    crosscode_util::init_tracing()?;
    crosscode_util::init_service_telemetry("crosscode-backend", env!("CARGO_PKG_VERSION"), "bridge");

    let config = SimConfig::from_env();
    info!(
        step_delay_ms = config.step_delay.as_millis() as u64,
        fail_step = config.fail_step.as_deref().unwrap_or("-"),
        "simulated backend"
    );
    let svc = BridgeSvc::new(simulated_backend(config));

    crosscode_util::serve_grpc(
        "crosscode-backend (BridgeService)",
        BACKEND_ADDR_ENV,
        DEFAULT_BACKEND_ADDR,
        |server| server.add_service(BridgeServiceServer::new(svc)),
    )
    .await
}
