//! Scripted stand-ins for the native backend's commands.
//!
//! Operations walk their registered steps with a fixed delay and report each
//! one; nothing touches the filesystem or a device.

use std::time::Duration;

use crosscode_ops::registry::{Operation, DEPLOY, INSTALL_SDK};
use crosscode_ops::{
    CommandContext, DeployParams, DeviceInfo, HandlerResult, InstallSdkParams, LocalBackend, Topic,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::info;

pub const STEP_DELAY_ENV: &str = "CROSSCODE_SIM_STEP_DELAY_MS";
pub const FAIL_STEP_ENV: &str = "CROSSCODE_SIM_FAIL_STEP";
const DEFAULT_STEP_DELAY_MS: u64 = 400;
/// Marker the console fold treats as "command failed".
const FAILED_DONE: &str = "command.done.999";

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub step_delay: Duration,
    /// Step id that reports `failed` and rejects the call.
    pub fail_step: Option<String>,
    pub devices: Vec<DeviceInfo>,
}

impl SimConfig {
    pub fn from_env() -> Self {
        let fail_step = std::env::var(FAIL_STEP_ENV)
            .ok()
            .map(|step| step.trim().to_string())
            .filter(|step| !step.is_empty());
        Self {
            step_delay: Duration::from_millis(crosscode_util::env_u64(
                STEP_DELAY_ENV,
                DEFAULT_STEP_DELAY_MS,
            )),
            fail_step,
            ..Self::default()
        }
    }

    fn fails_at(&self, step_id: &str) -> bool {
        self.fail_step.as_deref() == Some(step_id)
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(DEFAULT_STEP_DELAY_MS),
            fail_step: None,
            devices: vec![DeviceInfo {
                name: "Simulated iPhone".into(),
                id: 1,
                uuid: "00008110-000A1B2C3D4E5F60".into(),
            }],
        }
    }
}

pub fn register_simulated_commands(backend: &LocalBackend, config: SimConfig) {
    let cfg = config.clone();
    backend.register_fn(&INSTALL_SDK.entry_point(), move |ctx| {
        let cfg = cfg.clone();
        async move { install_sdk(&ctx, &cfg).await }
    });

    let cfg = config.clone();
    backend.register_fn(&DEPLOY.entry_point(), move |ctx| {
        let cfg = cfg.clone();
        async move { deploy(&ctx, &cfg).await }
    });

    backend.register_fn("is_windows", |_ctx| async move { Ok(Value::Bool(cfg!(windows))) });

    backend.register_fn("has_darwin_sdk", |ctx| async move {
        // The native command answers with the installed SDK version, or "none".
        let version = if str_param(&ctx, "toolchainPath").is_empty() {
            "none"
        } else {
            "26.0"
        };
        Ok(Value::String(version.to_string()))
    });

    backend.register_fn("validate_toolchain", |ctx| async move {
        Ok(Value::Bool(!str_param(&ctx, "toolchainPath").is_empty()))
    });

    let devices = config.devices.clone();
    backend.register_fn("refresh_idevice", move |ctx| {
        let devices = devices.clone();
        async move { refresh_devices(&ctx, &devices) }
    });

    let cfg = config.clone();
    backend.register_fn("build_swift", move |ctx| {
        let cfg = cfg.clone();
        async move { build(&ctx, &cfg).await }
    });

    let delay = config.step_delay;
    backend.register_fn("clean_swift", move |ctx| async move { clean(&ctx, delay).await });
}

async fn install_sdk(ctx: &CommandContext, cfg: &SimConfig) -> HandlerResult {
    let params: InstallSdkParams = decode_params(ctx)?;
    info!(xcode = %params.xcode_path, toolchain = %params.toolchain_path, "installing SDK");
    run_steps(ctx, &INSTALL_SDK, cfg).await?;
    Ok(Value::Null)
}

async fn deploy(ctx: &CommandContext, cfg: &SimConfig) -> HandlerResult {
    let params: DeployParams = decode_params(ctx)?;
    info!(project = %params.project_path, device = %params.device.name, "deploying");
    run_steps(ctx, &DEPLOY, cfg).await?;
    Ok(json!({ "device": params.device.uuid }))
}

fn refresh_devices(ctx: &CommandContext, devices: &[DeviceInfo]) -> HandlerResult {
    let payload = serde_json::to_value(devices).map_err(|err| err.to_string())?;
    ctx.emit(&Topic::Devices, payload);
    Ok(Value::Null)
}

async fn clean(ctx: &CommandContext, delay: Duration) -> HandlerResult {
    let folder = required_str(ctx, "folder")?;
    ctx.console(format!("Cleaning {folder}/.build"));
    pause(ctx, delay).await?;
    ctx.console("command.done.0");
    Ok(Value::Null)
}

async fn build(ctx: &CommandContext, cfg: &SimConfig) -> HandlerResult {
    let folder = required_str(ctx, "folder")?;
    let debug = ctx.params.get("debug").and_then(Value::as_bool).unwrap_or(false);
    let mode = if debug { "debug" } else { "release" };

    let lines = [
        format!("Building for {mode} in {folder}"),
        "Compiling swift module".to_string(),
        "Linking app binary".to_string(),
        "Packaging .ipa".to_string(),
    ];
    for (idx, line) in lines.iter().enumerate() {
        ctx.console(line.clone());
        if let Err(err) = pause(ctx, cfg.step_delay).await {
            ctx.console(FAILED_DONE);
            return Err(err);
        }
        if idx == 1 && cfg.fails_at("build") {
            return fail_with_console(ctx, "swift build exited with 1");
        }
    }
    ctx.console("command.done.0");
    Ok(json!({ "ipa": format!("{folder}/.build/app.ipa") }))
}

fn fail_with_console<T>(ctx: &CommandContext, message: &str) -> Result<T, String> {
    ctx.console(message);
    ctx.console(FAILED_DONE);
    Err(message.to_string())
}

/// Reports each step of `operation` in order. Stops at the first failing or
/// cancelled step.
async fn run_steps(
    ctx: &CommandContext,
    operation: &'static Operation,
    cfg: &SimConfig,
) -> Result<(), String> {
    let steps = ctx.steps(operation);
    for step in operation.steps {
        if ctx.cancel.is_cancelled() {
            return Err(format!("{} cancelled", operation.title));
        }
        steps.started(step.id);
        pause(ctx, cfg.step_delay).await?;
        if cfg.fails_at(step.id) {
            steps.failed(step.id, "simulated failure");
            return Err(format!("{} failed", step.label));
        }
        steps.finished(step.id);
    }
    Ok(())
}

async fn pause(ctx: &CommandContext, delay: Duration) -> Result<(), String> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(format!("{} cancelled", ctx.command)),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

fn decode_params<T: DeserializeOwned>(ctx: &CommandContext) -> Result<T, String> {
    serde_json::from_value(ctx.params.clone())
        .map_err(|err| format!("invalid parameters for {}: {err}", ctx.command))
}

fn str_param(ctx: &CommandContext, key: &str) -> String {
    ctx.params
        .get(key)
        .and_then(Value::as_str)
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

fn required_str(ctx: &CommandContext, key: &str) -> Result<String, String> {
    let value = str_param(ctx, key);
    if value.is_empty() {
        return Err(format!("{key} is required"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosscode_ops::{
        CommandConsole, ConsoleEvent, OperationError, OperationExecutor, RunPhase, StepStatus,
    };
    use std::sync::Arc;

    fn fast(fail_step: Option<&str>) -> SimConfig {
        SimConfig {
            step_delay: Duration::from_millis(1),
            fail_step: fail_step.map(str::to_string),
            ..SimConfig::default()
        }
    }

    fn install_params() -> InstallSdkParams {
        InstallSdkParams {
            xcode_path: "/tmp/Xcode.xip".into(),
            toolchain_path: "/opt/swift".into(),
            is_dir: false,
        }
    }

    #[tokio::test]
    async fn install_sdk_reports_every_step() {
        let backend = LocalBackend::new();
        register_simulated_commands(&backend, fast(None));
        let executor = OperationExecutor::new(Arc::new(backend));

        executor.start_operation(install_params().into()).await.unwrap();
        let state = executor.state().unwrap();
        let ids: Vec<&str> = INSTALL_SDK.steps.iter().map(|s| s.id).collect();
        assert_eq!(state.started(), ids.as_slice());
        assert_eq!(state.completed(), ids.as_slice());
    }

    #[tokio::test]
    async fn configured_step_fails_the_call() {
        let backend = LocalBackend::new();
        register_simulated_commands(&backend, fast(Some("extract_xip")));
        let executor = OperationExecutor::new(Arc::new(backend));

        let err = executor
            .start_operation(install_params().into())
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Failed { .. }));
        let snapshot = executor.snapshot().unwrap();
        assert_eq!(
            snapshot.phase,
            RunPhase::Failed {
                message: "Extracting Xcode failed".into()
            }
        );
        assert_eq!(snapshot.state.completed(), ["create_stage"]);
        assert_eq!(
            snapshot.state.step_status("extract_xip"),
            StepStatus::Failed("simulated failure".into())
        );
        assert_eq!(snapshot.state.step_status("copy_files"), StepStatus::Pending);
    }

    #[tokio::test]
    async fn build_streams_console_until_done() {
        let backend = LocalBackend::new();
        register_simulated_commands(&backend, fast(None));
        let mut output = backend.events().subscribe(Topic::BuildOutput);

        let result = crosscode_ops::Backend::invoke(
            &backend,
            crosscode_ops::InvokeRequest::new("build_swift", json!({"folder": "/src/app", "debug": true})),
        )
        .await
        .unwrap();
        assert_eq!(result, json!({"ipa": "/src/app/.build/app.ipa"}));

        let mut console = CommandConsole::default();
        let done = console.follow(&mut output, |_| {}).await;
        assert_eq!(done, Some(ConsoleEvent::Finished { exit_code: 0 }));
        assert_eq!(console.lines().next(), Some("Building for debug in /src/app"));
    }

    #[tokio::test]
    async fn failed_build_ends_with_failure_marker() {
        let backend = LocalBackend::new();
        register_simulated_commands(&backend, fast(Some("build")));
        let mut output = backend.events().subscribe(Topic::BuildOutput);

        let err = crosscode_ops::Backend::invoke(
            &backend,
            crosscode_ops::InvokeRequest::new("build_swift", json!({"folder": "/src/app"})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "swift build exited with 1");

        let mut console = CommandConsole::default();
        assert_eq!(console.follow(&mut output, |_| {}).await, Some(ConsoleEvent::Failed));
        assert_eq!(console.lines().last(), Some("Command failed"));
    }

    #[tokio::test]
    async fn refresh_publishes_device_list() {
        let backend = LocalBackend::new();
        register_simulated_commands(&backend, fast(None));
        let mut devices = backend.events().subscribe(Topic::Devices);

        crosscode_ops::Backend::invoke(
            &backend,
            crosscode_ops::InvokeRequest::new("refresh_idevice", Value::Null),
        )
        .await
        .unwrap();
        let list: Vec<DeviceInfo> = serde_json::from_value(devices.try_recv().unwrap()).unwrap();
        assert_eq!(list[0].name, "Simulated iPhone");
    }

    #[tokio::test]
    async fn missing_folder_is_rejected() {
        let backend = LocalBackend::new();
        register_simulated_commands(&backend, fast(None));
        let err = crosscode_ops::Backend::invoke(
            &backend,
            crosscode_ops::InvokeRequest::new("clean_swift", json!({})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "folder is required");
    }
}
