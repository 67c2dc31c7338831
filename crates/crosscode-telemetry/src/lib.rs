//! Opt-in usage events and crash reports, written as local JSON files.
//!
//! Nothing leaves the machine. Events go to
//! `<data dir>/telemetry/<app>/events.jsonl` from a background thread; crash
//! reports land next to them under `crashes/`.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

const EVENT_QUEUE_CAPACITY: usize = 256;
const MAX_EVENT_BYTES: u64 = 2 * 1024 * 1024;
const EVENTS_FILE: &str = "events.jsonl";

#[derive(Clone, Debug)]
pub struct TelemetryOptions {
    pub app_name: &'static str,
    pub app_version: &'static str,
    pub usage_enabled: bool,
    pub crash_enabled: bool,
    pub install_id: Option<String>,
    /// Overrides `~/.local/share/crosscode`.
    pub data_dir: Option<PathBuf>,
}

pub struct Telemetry {
    app_name: String,
    app_version: String,
    session_id: String,
    install_id: Mutex<Option<String>>,
    usage_enabled: AtomicBool,
    crash_enabled: AtomicBool,
    sink: Sink,
    sender: SyncSender<UsageEvent>,
}

#[derive(Debug, Serialize)]
struct UsageEvent {
    event_type: String,
    at_unix_millis: i64,
    app: String,
    version: String,
    session_id: String,
    install_id: Option<String>,
    properties: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct CrashReport {
    at_unix_millis: i64,
    app: String,
    version: String,
    session_id: String,
    install_id: Option<String>,
    message: String,
    location: Option<String>,
    backtrace: Option<String>,
}

/// Where one app's telemetry files live.
#[derive(Clone, Debug)]
struct Sink {
    dir: PathBuf,
}

static TELEMETRY: OnceLock<Arc<Telemetry>> = OnceLock::new();

/// Installs the process-wide recorder. Later calls only update the flags.
pub fn init(options: TelemetryOptions) -> Arc<Telemetry> {
    if let Some(existing) = TELEMETRY.get() {
        existing.apply_options(&options);
        return Arc::clone(existing);
    }
    let telemetry = Telemetry::start(options);
    install_panic_hook(Arc::clone(&telemetry));
    match TELEMETRY.set(Arc::clone(&telemetry)) {
        Ok(()) => telemetry,
        // Lost a race with another init; keep the winner.
        Err(_) => TELEMETRY.get().map(Arc::clone).unwrap_or(telemetry),
    }
}

pub fn init_with_env(app_name: &'static str, app_version: &'static str) -> Arc<Telemetry> {
    init(TelemetryOptions {
        app_name,
        app_version,
        usage_enabled: env_flag("CROSSCODE_TELEMETRY"),
        crash_enabled: env_flag("CROSSCODE_TELEMETRY_CRASH"),
        install_id: std::env::var("CROSSCODE_TELEMETRY_INSTALL_ID").ok(),
        data_dir: None,
    })
}

pub fn global() -> Option<Arc<Telemetry>> {
    TELEMETRY.get().map(Arc::clone)
}

pub fn set_usage_enabled(enabled: bool) {
    if let Some(telemetry) = TELEMETRY.get() {
        telemetry.usage_enabled.store(enabled, Ordering::Relaxed);
    }
}

pub fn set_crash_enabled(enabled: bool) {
    if let Some(telemetry) = TELEMETRY.get() {
        telemetry.crash_enabled.store(enabled, Ordering::Relaxed);
    }
}

/// Records a usage event on the global recorder. A no-op until [`init`] runs
/// or while usage events are disabled.
pub fn event(event_type: &str, properties: &[(&str, &str)]) {
    if let Some(telemetry) = TELEMETRY.get() {
        telemetry.event(event_type, properties);
    }
}

pub fn generate_install_id() -> String {
    format!("{:x}-{:x}", now_millis(), std::process::id())
}

impl Telemetry {
    /// Starts a recorder and its writer thread without installing it globally.
    pub fn start(options: TelemetryOptions) -> Arc<Self> {
        let (sender, receiver) = sync_channel(EVENT_QUEUE_CAPACITY);
        let base = options.data_dir.clone().unwrap_or_else(default_data_dir);
        let telemetry = Arc::new(Telemetry {
            app_name: options.app_name.to_string(),
            app_version: options.app_version.to_string(),
            session_id: generate_install_id(),
            install_id: Mutex::new(options.install_id),
            usage_enabled: AtomicBool::new(options.usage_enabled),
            crash_enabled: AtomicBool::new(options.crash_enabled),
            sink: Sink::new(&base, options.app_name),
            sender,
        });
        spawn_writer(telemetry.sink.clone(), receiver);
        telemetry
    }

    pub fn events_path(&self) -> PathBuf {
        self.sink.events_path()
    }

    pub fn set_install_id(&self, install_id: Option<String>) {
        *self.install_id.lock() = install_id;
    }

    fn apply_options(&self, options: &TelemetryOptions) {
        self.usage_enabled
            .store(options.usage_enabled, Ordering::Relaxed);
        self.crash_enabled
            .store(options.crash_enabled, Ordering::Relaxed);
        if options.install_id.is_some() {
            self.set_install_id(options.install_id.clone());
        }
    }

    /// Queues one event. Dropped when disabled or when the queue is full.
    pub fn event(&self, event_type: &str, properties: &[(&str, &str)]) -> bool {
        if !self.usage_enabled.load(Ordering::Relaxed) {
            return false;
        }
        let event = self.usage_event(event_type, properties);
        self.sender.try_send(event).is_ok()
    }

    fn usage_event(&self, event_type: &str, properties: &[(&str, &str)]) -> UsageEvent {
        let properties = properties
            .iter()
            .filter(|(key, _)| !key.trim().is_empty())
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        UsageEvent {
            event_type: event_type.to_string(),
            at_unix_millis: now_millis(),
            app: self.app_name.clone(),
            version: self.app_version.clone(),
            session_id: self.session_id.clone(),
            install_id: self.install_id.lock().clone(),
            properties,
        }
    }

    fn crash(&self, message: String, location: Option<String>, backtrace: Option<String>) {
        if !self.crash_enabled.load(Ordering::Relaxed) {
            return;
        }
        let report = CrashReport {
            at_unix_millis: now_millis(),
            app: self.app_name.clone(),
            version: self.app_version.clone(),
            session_id: self.session_id.clone(),
            install_id: self.install_id.lock().clone(),
            message,
            location,
            backtrace,
        };
        if let Err(err) = self.sink.write_crash(&report) {
            eprintln!("telemetry: failed to write crash report: {err}");
        }
        // The process may be about to exit; write the marker event inline.
        let marker = self.usage_event("crash", &[]);
        if let Err(err) = self.sink.append_event(&marker) {
            eprintln!("telemetry: failed to record crash event: {err}");
        }
    }
}

impl Sink {
    fn new(base: &Path, app_name: &str) -> Self {
        Self {
            dir: base.join("telemetry").join(app_name),
        }
    }

    fn events_path(&self) -> PathBuf {
        self.dir.join(EVENTS_FILE)
    }

    fn append_event(&self, event: &UsageEvent) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.events_path();
        rotate_if_needed(&path, MAX_EVENT_BYTES)?;
        let line = serde_json::to_string(event).map_err(io::Error::other)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{line}")
    }

    fn write_crash(&self, report: &CrashReport) -> io::Result<PathBuf> {
        let dir = self.dir.join("crashes");
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!(
            "crash-{}-{}.json",
            report.at_unix_millis,
            std::process::id()
        ));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        serde_json::to_writer_pretty(file, report).map_err(io::Error::other)?;
        Ok(path)
    }
}

fn spawn_writer(sink: Sink, receiver: Receiver<UsageEvent>) {
    let spawned = std::thread::Builder::new()
        .name("telemetry-writer".into())
        .spawn(move || {
            while let Ok(event) = receiver.recv() {
                if let Err(err) = sink.append_event(&event) {
                    eprintln!("telemetry: failed to write {}: {err}", sink.events_path().display());
                }
            }
        });
    if let Err(err) = spawned {
        eprintln!("telemetry: writer thread unavailable: {err}");
    }
}

fn install_panic_hook(telemetry: Arc<Telemetry>) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let payload = info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .map(|msg| msg.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic".to_string());
        let location = info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()));
        let backtrace = Some(std::backtrace::Backtrace::capture().to_string());
        telemetry.crash(message, location, backtrace);
        default_hook(info);
    }));
}

fn rotate_if_needed(path: &Path, max_bytes: u64) -> io::Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() >= max_bytes => {
            let rotated = path.with_extension("jsonl.1");
            let _ = fs::remove_file(&rotated);
            fs::rename(path, rotated)
        }
        _ => Ok(()),
    }
}

fn default_data_dir() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".local/share/crosscode"),
        Err(_) => std::env::temp_dir().join("crosscode"),
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| parse_flag(&value))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn options(dir: &Path, usage: bool) -> TelemetryOptions {
        TelemetryOptions {
            app_name: "crosscode-test",
            app_version: "0.0.0",
            usage_enabled: usage,
            crash_enabled: true,
            install_id: Some("install-1".into()),
            data_dir: Some(dir.to_path_buf()),
        }
    }

    fn wait_for_lines(path: &Path, count: usize) -> Vec<serde_json::Value> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let lines: Vec<serde_json::Value> = fs::read_to_string(path)
                .unwrap_or_default()
                .lines()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect();
            if lines.len() >= count || Instant::now() > deadline {
                return lines;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn flags_accept_common_truthy_values() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_flag(value), "{value}");
        }
        for value in ["", "0", "false", "off", "enabled"] {
            assert!(!parse_flag(value), "{value}");
        }
    }

    #[test]
    fn events_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = Telemetry::start(options(dir.path(), true));

        assert!(telemetry.event("operation.start", &[("operation", "deploy"), (" ", "x")]));
        assert!(telemetry.event("operation.settled", &[("phase", "succeeded")]));

        let lines = wait_for_lines(&telemetry.events_path(), 2);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_type"], "operation.start");
        assert_eq!(lines[0]["properties"], serde_json::json!({"operation": "deploy"}));
        assert_eq!(lines[0]["install_id"], "install-1");
        assert_eq!(lines[1]["properties"]["phase"], "succeeded");
    }

    #[test]
    fn disabled_recorder_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = Telemetry::start(options(dir.path(), false));
        assert!(!telemetry.event("operation.start", &[]));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!telemetry.events_path().exists());
    }

    #[test]
    fn crash_reports_land_in_crashes_dir() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = Telemetry::start(options(dir.path(), false));
        telemetry.crash("boom".into(), Some("src/main.rs:1".into()), None);

        let crashes = dir.path().join("telemetry/crosscode-test/crashes");
        let entries: Vec<_> = fs::read_dir(&crashes).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let body = fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        let report: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["message"], "boom");
        assert_eq!(report["location"], "src/main.rs:1");
    }

    #[test]
    fn oversized_log_is_rotated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(EVENTS_FILE);
        fs::write(&path, vec![b'x'; 16]).unwrap();

        rotate_if_needed(&path, 8).unwrap();
        assert!(!path.exists());
        assert!(dir.path().join("events.jsonl.1").exists());

        rotate_if_needed(&path, 8).unwrap();
    }
}
