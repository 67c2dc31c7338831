use std::{
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use crosscode_telemetry as telemetry;
use serde::Serialize;
use tonic::transport::{server::Router, Server};
use tracing::info;

pub const DEFAULT_BACKEND_ADDR: &str = "127.0.0.1:50061";
pub const BACKEND_ADDR_ENV: &str = "CROSSCODE_BACKEND_ADDR";

pub fn env_addr(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub fn backend_addr() -> String {
    env_addr(BACKEND_ADDR_ENV, DEFAULT_BACKEND_ADDR)
}

/// Turns `host:port` into a URI tonic can dial. Addresses that already carry a
/// scheme are kept.
pub fn endpoint_uri(addr: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

pub fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

pub fn data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share/crosscode")
    } else {
        std::env::temp_dir().join("crosscode")
    }
}

pub fn state_dir() -> PathBuf {
    data_dir().join("state")
}

pub fn state_file_path(file_name: &str) -> PathBuf {
    state_dir().join(file_name)
}

pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            let rest = path.strip_prefix("~/").unwrap_or("");
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();
    Ok(())
}

/// Same filter as [`init_tracing`] but logs go to stderr, leaving stdout for
/// command output.
pub fn init_cli_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("warn".parse()?),
        )
        .with_writer(io::stderr)
        .init();
    Ok(())
}

pub fn init_service_telemetry(app_name: &'static str, app_version: &'static str, service_name: &str) {
    telemetry::init_with_env(app_name, app_version);
    telemetry::event("service.start", &[("service", service_name)]);
}

/// Serves until Ctrl-C.
pub async fn serve_grpc<F>(
    app_name: &str,
    addr_env: &str,
    default_addr: &str,
    add_service: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: FnOnce(&mut Server) -> Router,
{
    let addr_str = env_addr(addr_env, default_addr);
    let addr: SocketAddr = addr_str.parse()?;
    info!("{app_name} listening on {addr}");

    let mut server = Server::builder();
    add_service(&mut server)
        .serve_with_shutdown(addr, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down");
            }
        })
        .await?;
    Ok(())
}

pub async fn serve_grpc_with_telemetry<F>(
    app_name: &'static str,
    app_version: &'static str,
    service_name: &str,
    addr_env: &str,
    default_addr: &str,
    add_service: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: FnOnce(&mut Server) -> Router,
{
    init_tracing()?;
    init_service_telemetry(app_name, app_version, service_name);
    serve_grpc(app_name, addr_env, default_addr, add_service).await
}
