mod config;
mod render;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use crosscode_backend::GrpcBackend;
use crosscode_ops::{
    registry, Backend, CommandConsole, CommandRunner, DeployParams, DeviceInfo, InstallSdkParams,
    OperationExecutor, OperationParams, OperationView, Topic,
};
use crosscode_telemetry as telemetry;
use serde_json::Value;

use crate::config::CliConfig;
use crate::render::{parse_params, ProgressPrinter};

const DEVICE_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "crosscode-cli", version, about = "CrossCode backend CLI")]
struct Cli {
    /// Backend address (host:port); defaults to the saved config or CROSSCODE_BACKEND_ADDR
    #[arg(long, global = true)]
    addr: Option<String>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List registered operations and their steps
    Operations {
        /// Ask the backend instead of the built-in registry
        #[arg(long)]
        remote: bool,
    },
    /// List commands the backend accepts
    Commands,
    /// Install the Darwin SDK from an Xcode archive
    InstallSdk {
        #[arg(long)]
        xcode: Option<String>,
        #[arg(long)]
        toolchain: Option<String>,
        /// The Xcode path is an extracted Xcode.app directory
        #[arg(long)]
        dir: bool,
    },
    /// Build, sign, install and launch a project on a device
    Deploy {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        toolchain: Option<String>,
        /// Device UUID; the first connected device when omitted
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        debug: bool,
    },
    /// Run a plain backend command and follow its console output
    Run {
        command: String,
        /// Parameter as key=value (repeatable)
        #[arg(long = "param", short = 'p')]
        params: Vec<String>,
    },
    /// Print payloads arriving on a channel
    Listen {
        channel: String,
        /// Stop after this many payloads
        #[arg(long)]
        count: Option<usize>,
    },
    /// Send a front-end event (e.g. a 2FA code) to the backend
    Emit {
        channel: String,
        /// JSON payload; plain text is sent as a string
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    crosscode_util::init_cli_tracing()?;
    telemetry::init_with_env("crosscode-cli", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let mut cfg = CliConfig::load();
    if let Some(addr) = cli.addr {
        cfg.backend_addr = addr;
    }

    match cli.cmd {
        Cmd::Operations { remote: false } => {
            for op in registry::all() {
                println!("{}\t{}\t{}", op.id, op.title, op.entry_point());
                for step in op.steps {
                    println!("  {}\t{}", step.id, step.label);
                }
            }
        }
        Cmd::Operations { remote: true } => {
            let backend = GrpcBackend::connect(&cfg.backend_addr).await?;
            for op in backend.list_operations().await? {
                println!("{}\t{}\t{}", op.id, op.title, op.entry_point);
                for step in op.steps {
                    println!("  {}\t{}", step.id, step.label);
                }
            }
        }
        Cmd::Commands => {
            let backend = GrpcBackend::connect(&cfg.backend_addr).await?;
            for command in backend.list_commands().await? {
                println!("{command}");
            }
        }
        Cmd::InstallSdk {
            xcode,
            toolchain,
            dir,
        } => {
            let params = InstallSdkParams {
                xcode_path: pick(xcode, &cfg.last_xcode_path),
                toolchain_path: pick(toolchain, &cfg.toolchain_path),
                is_dir: dir,
            };
            cfg.last_xcode_path = params.xcode_path.clone();
            cfg.toolchain_path = params.toolchain_path.clone();
            let backend = Arc::new(GrpcBackend::connect(&cfg.backend_addr).await?);
            let outcome = run_operation(backend, params.into()).await;
            remember(&cfg);
            outcome?;
        }
        Cmd::Deploy {
            project,
            toolchain,
            device,
            debug,
        } => {
            let backend = Arc::new(GrpcBackend::connect(&cfg.backend_addr).await?);
            let device = match device {
                Some(uuid) => cfg
                    .last_device
                    .clone()
                    .filter(|known| known.uuid == uuid)
                    .unwrap_or(DeviceInfo {
                        name: uuid.clone(),
                        id: 0,
                        uuid,
                    }),
                None => first_device(backend.as_ref()).await?,
            };
            let params = DeployParams {
                project_path: pick(project, &cfg.last_project_path),
                toolchain_path: pick(toolchain, &cfg.toolchain_path),
                device: device.clone(),
                debug,
            };
            cfg.last_project_path = params.project_path.clone();
            cfg.toolchain_path = params.toolchain_path.clone();
            cfg.last_device = Some(device);
            let outcome = run_operation(backend, params.into()).await;
            remember(&cfg);
            outcome?;
        }
        Cmd::Run { command, params } => {
            let params = parse_params(&params)?;
            let backend = Arc::new(GrpcBackend::connect(&cfg.backend_addr).await?);
            run_command(backend, &command, params).await?;
        }
        Cmd::Listen { channel, count } => {
            let backend = GrpcBackend::connect(&cfg.backend_addr).await?;
            let mut subscription = backend.listen(&Topic::parse(&channel)).await?;
            let mut received = 0usize;
            loop {
                tokio::select! {
                    payload = subscription.recv() => {
                        let Some(payload) = payload else { break };
                        println!("{}", display_payload(&payload));
                        received += 1;
                        if count.is_some_and(|limit| received >= limit) {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Cmd::Emit { channel, payload } => {
            let backend = GrpcBackend::connect(&cfg.backend_addr).await?;
            let payload =
                serde_json::from_str(&payload).unwrap_or(Value::String(payload));
            backend.emit(&Topic::parse(&channel), payload).await?;
        }
    }

    Ok(())
}

fn pick(arg: Option<String>, remembered: &str) -> String {
    arg.unwrap_or_else(|| remembered.to_string())
}

fn remember(cfg: &CliConfig) {
    if let Err(err) = cfg.save() {
        eprintln!("Failed to save CLI config: {err}");
    }
}

fn display_payload(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Runs one operation, printing step transitions as they arrive. Ctrl-C
/// cancels it.
async fn run_operation(
    backend: Arc<dyn Backend>,
    params: OperationParams,
) -> Result<(), Box<dyn std::error::Error>> {
    telemetry::event("cli.operation", &[("operation", params.operation().id)]);
    let executor = Arc::new(OperationExecutor::new(backend));
    let mut watcher = executor.watch();
    let mut printer = ProgressPrinter::default();

    let mut run = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.start_operation(params).await })
    };
    let result = loop {
        tokio::select! {
            result = &mut run => break result?,
            changed = watcher.changed() => {
                if !changed {
                    continue;
                }
                if let Some(snapshot) = watcher.snapshot() {
                    for line in printer.update(&snapshot) {
                        println!("{line}");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Cancelling...");
                executor.cancel();
            }
        }
    };

    if let Some(snapshot) = executor.snapshot() {
        for line in printer.update(&snapshot) {
            println!("{line}");
        }
        println!();
        print!("{}", OperationView::new(&snapshot));
    }
    result?;
    Ok(())
}

/// Runs a plain command while echoing `build-output` lines. Ctrl-C cancels it.
async fn run_command(
    backend: Arc<dyn Backend>,
    command: &str,
    params: Value,
) -> Result<(), Box<dyn std::error::Error>> {
    telemetry::event("cli.command", &[("command", command)]);
    let mut output = backend.listen(&Topic::BuildOutput).await?;
    let runner = CommandRunner::new(backend);
    let mut console = CommandConsole::default();

    let run = runner.run_command(command, params);
    tokio::pin!(run);
    let mut listening = true;
    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            payload = output.recv(), if listening => match payload {
                Some(payload) => println!("{}", console.push_payload(&payload).render()),
                None => listening = false,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Cancelling {command}...");
                runner.cancel_command();
            }
        }
    };
    while let Some(payload) = output.try_recv() {
        println!("{}", console.push_payload(&payload).render());
    }
    output.unsubscribe();

    let value = result?;
    if !value.is_null() {
        println!("{}", display_payload(&value));
    }
    Ok(())
}

/// Asks the backend for connected devices and takes the first one.
async fn first_device(backend: &dyn Backend) -> Result<DeviceInfo, Box<dyn std::error::Error>> {
    let mut devices = backend.listen(&Topic::Devices).await?;
    backend
        .invoke(crosscode_ops::InvokeRequest::new("refresh_idevice", Value::Null))
        .await?;
    let payload = tokio::time::timeout(DEVICE_WAIT, devices.recv())
        .await
        .map_err(|_| "timed out waiting for the device list")?
        .ok_or("device list channel closed")?;
    let list: Vec<DeviceInfo> = serde_json::from_value(payload)?;
    list.into_iter()
        .next()
        .ok_or_else(|| "no devices connected".into())
}
