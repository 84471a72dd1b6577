//! Local-process backend
//!
//! Each bot is an OS process spawned by this replica, listening on a port
//! allocated at create time. Only the replica that created a process can control
//! it, so this backend suits single-host and development deployments and is not
//! registered when replicas coordinate (see `Settings::effective_backends`).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{RegistryBuilder, Runtime};
use crate::config::LocalBackendConfig;
use crate::error::RuntimeError;
use crate::models::{CreateSpec, Endpoint, RuntimeHandle, StatusSnapshot};

pub const BACKEND: &str = "local";

pub fn register(builder: &mut RegistryBuilder) {
    builder.register(BACKEND, |config| {
        if !config.local.enabled {
            return Ok(None);
        }
        Ok(Some(Arc::new(LocalRuntime::new(config.local.clone())) as Arc<dyn Runtime>))
    });
}

struct LocalProcess {
    name: String,
    spec: CreateSpec,
    port: u16,
    child: Option<Child>,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    last_exit: Option<String>,
    /// Previous (cpu ticks, wall clock) sample for usage deltas
    cpu_sample: Option<(u64, Instant)>,
}

impl LocalProcess {
    /// Reap the child if it exited since the last look
    fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.last_exit = Some(status.to_string());
                self.mark_stopped();
                false
            }
            Err(e) => {
                self.last_exit = Some(e.to_string());
                self.mark_stopped();
                false
            }
        }
    }

    fn mark_stopped(&mut self) {
        self.child = None;
        self.pid = None;
        self.cpu_sample = None;
        if self.stopped_at.is_none() {
            self.stopped_at = Some(Utc::now());
        }
    }
}

pub struct LocalRuntime {
    config: LocalBackendConfig,
    /// One slot per handle for the life of the replica; handles are never deleted
    processes: RwLock<HashMap<String, Arc<Mutex<LocalProcess>>>>,
}

impl LocalRuntime {
    pub fn new(config: LocalBackendConfig) -> Self {
        Self {
            config,
            processes: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, handle: &RuntimeHandle) -> Result<Arc<Mutex<LocalProcess>>, RuntimeError> {
        let processes = self
            .processes
            .read()
            .map_err(|_| RuntimeError::Transient("process table poisoned".into()))?;
        processes
            .get(handle.as_str())
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(handle.to_string()))
    }

    fn spawn(&self, handle: &RuntimeHandle, process: &mut LocalProcess) -> Result<(), RuntimeError> {
        let (program, args) = process
            .spec
            .command
            .split_first()
            .ok_or_else(|| RuntimeError::Lifecycle(format!("{} has no command", handle)))?;

        if !port_available(&self.config.bind_host, process.port) {
            let port = free_port(&self.config.bind_host)
                .ok_or_else(|| RuntimeError::Lifecycle("no free local port available".to_string()))?;
            warn!(handle = %handle, taken = process.port, port, "allocated port is in use; moving bot to a new port");
            process.port = port;
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&process.spec.env)
            .env("PORT", process.port.to_string())
            .env("HOST", &self.config.bind_host)
            .env("BOT_HANDLE", handle.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.work_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| RuntimeError::Lifecycle(format!("failed to spawn {}: {}", program, e)))?;

        process.pid = child.id();
        process.child = Some(child);
        process.started_at = Some(Utc::now());
        process.stopped_at = None;
        process.last_exit = None;
        process.cpu_sample = None;

        info!(handle = %handle, bot = %process.name, pid = ?process.pid, port = process.port, "local bot process started");
        Ok(())
    }

    async fn terminate(&self, handle: &RuntimeHandle, process: &mut LocalProcess) -> Result<(), RuntimeError> {
        if !process.is_running() {
            return Ok(());
        }
        let grace = Duration::from_secs(self.config.stop_grace_secs);
        let Some(child) = process.child.as_mut() else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SAFETY: plain signal delivery to a pid we spawned and still own
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                process.last_exit = Some(status.to_string());
            }
            Ok(Err(e)) => {
                return Err(RuntimeError::Lifecycle(format!("waiting for {}: {}", handle, e)));
            }
            Err(_) => {
                warn!(handle = %handle, "process ignored SIGTERM, killing");
                child
                    .kill()
                    .await
                    .map_err(|e| RuntimeError::Lifecycle(format!("failed to kill {}: {}", handle, e)))?;
                process.last_exit = Some("killed".to_string());
            }
        }

        process.mark_stopped();
        info!(handle = %handle, bot = %process.name, "local bot process stopped");
        Ok(())
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    fn kind(&self) -> &'static str {
        BACKEND
    }

    async fn create(&self, bot_name: &str, spec: &CreateSpec) -> Result<RuntimeHandle, RuntimeError> {
        if spec.command.is_empty() {
            return Err(RuntimeError::Provision(
                "local backend requires a command".to_string(),
            ));
        }
        let port = free_port(&self.config.bind_host)
            .ok_or_else(|| RuntimeError::Provision("no free local port available".to_string()))?;

        let handle = RuntimeHandle::new(format!("local-{}", &Uuid::new_v4().simple().to_string()[..12]));
        let process = LocalProcess {
            name: bot_name.to_string(),
            spec: spec.clone(),
            port,
            child: None,
            pid: None,
            started_at: None,
            stopped_at: None,
            last_exit: None,
            cpu_sample: None,
        };

        self.processes
            .write()
            .map_err(|_| RuntimeError::Provision("process table poisoned".into()))?
            .insert(handle.to_string(), Arc::new(Mutex::new(process)));

        debug!(handle = %handle, port, "local bot slot created");
        Ok(handle)
    }

    async fn start(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        let entry = self.entry(handle).map_err(lifecycle)?;
        let mut process = entry.lock().await;
        if process.is_running() {
            return Ok(());
        }
        self.spawn(handle, &mut process)
    }

    async fn stop(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        let entry = self.entry(handle).map_err(lifecycle)?;
        let mut process = entry.lock().await;
        self.terminate(handle, &mut process).await
    }

    async fn restart(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        let entry = self.entry(handle).map_err(lifecycle)?;
        let mut process = entry.lock().await;
        self.terminate(handle, &mut process).await?;
        self.spawn(handle, &mut process)
    }

    async fn inspect(&self, handle: &RuntimeHandle) -> Result<StatusSnapshot, RuntimeError> {
        let entry = self.entry(handle)?;
        let mut process = entry.lock().await;

        let mut snapshot = StatusSnapshot::for_handle(handle);
        snapshot.ip_address = Some(self.config.bind_host.clone());
        snapshot.host_port = Some(process.port);
        snapshot.started_at = process.started_at;

        if process.is_running() {
            snapshot.healthy = true;
            if let Some(pid) = process.pid {
                snapshot.memory_usage = proc_stats::resident_bytes(pid);
                if let Some(ticks) = proc_stats::cpu_ticks(pid) {
                    let now = Instant::now();
                    snapshot.cpu_usage = process
                        .cpu_sample
                        .and_then(|(prev, at)| proc_stats::cpu_percent(prev, ticks, now.duration_since(at)));
                    process.cpu_sample = Some((ticks, now));
                }
            }
        } else {
            snapshot.stopped_at = process.stopped_at;
            snapshot.error_message = Some(match &process.last_exit {
                Some(exit) => format!("process exited: {}", exit),
                None => "process not started".to_string(),
            });
        }

        Ok(snapshot)
    }

    async fn resolve_endpoint(&self, handle: &RuntimeHandle) -> Result<Option<Endpoint>, RuntimeError> {
        let entry = self.entry(handle)?;
        let mut process = entry.lock().await;
        if !process.is_running() {
            return Ok(None);
        }
        Ok(Some(Endpoint::http(self.config.bind_host.clone(), process.port)))
    }
}

fn lifecycle(e: RuntimeError) -> RuntimeError {
    match e {
        RuntimeError::NotFound(h) => RuntimeError::Lifecycle(format!("unknown handle {}", h)),
        other => other,
    }
}

/// Bind to port 0 on `host` and return the OS-assigned port. The listener is
/// dropped before the bot binds, so the port can be taken in between; `spawn`
/// checks it again.
fn free_port(host: &str) -> Option<u16> {
    let listener = std::net::TcpListener::bind((host, 0)).ok()?;
    Some(listener.local_addr().ok()?.port())
}

fn port_available(host: &str, port: u16) -> bool {
    std::net::TcpListener::bind((host, port)).is_ok()
}

mod proc_stats {
    use std::time::Duration;

    /// utime + stime in clock ticks, from /proc/<pid>/stat
    pub fn parse_cpu_ticks(stat: &str) -> Option<u64> {
        // comm may contain spaces; fields resume after the last ')'
        let rest = &stat[stat.rfind(')')? + 1..];
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        Some(utime + stime)
    }

    pub fn cpu_percent(prev_ticks: u64, ticks: u64, elapsed: Duration) -> Option<f64> {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 || ticks < prev_ticks {
            return None;
        }
        let hz = clock_ticks_per_sec()?;
        Some((ticks - prev_ticks) as f64 / hz / secs * 100.0)
    }

    #[cfg(target_os = "linux")]
    pub fn cpu_ticks(pid: u32) -> Option<u64> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        parse_cpu_ticks(&stat)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn cpu_ticks(_pid: u32) -> Option<u64> {
        None
    }

    #[cfg(target_os = "linux")]
    pub fn resident_bytes(pid: u32) -> Option<u64> {
        let statm = std::fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        // SAFETY: sysconf has no preconditions
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return None;
        }
        Some(pages * page_size as u64)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn resident_bytes(_pid: u32) -> Option<u64> {
        None
    }

    #[cfg(unix)]
    fn clock_ticks_per_sec() -> Option<f64> {
        // SAFETY: sysconf has no preconditions
        let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        (hz > 0).then_some(hz as f64)
    }

    #[cfg(not(unix))]
    fn clock_ticks_per_sec() -> Option<f64> {
        None
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runtime() -> LocalRuntime {
        LocalRuntime::new(LocalBackendConfig {
            stop_grace_secs: 2,
            ..LocalBackendConfig::default()
        })
    }

    fn sleeper() -> CreateSpec {
        CreateSpec {
            command: vec!["sleep".into(), "30".into()],
            ..CreateSpec::default()
        }
    }

    #[tokio::test]
    async fn test_create_then_inspect_reports_same_handle() {
        let rt = runtime();
        let handle = rt.create("alpha", &sleeper()).await.unwrap();
        assert!(handle.as_str().starts_with("local-"));

        let snap = rt.inspect(&handle).await.unwrap();
        assert_eq!(snap.backend_handle.as_deref(), Some(handle.as_str()));
        assert!(!snap.healthy);
        assert_eq!(snap.error_message.as_deref(), Some("process not started"));
        assert!(rt.resolve_endpoint(&handle).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let rt = runtime();
        let handle = rt.create("alpha", &sleeper()).await.unwrap();

        rt.start(&handle).await.unwrap();
        let snap = rt.inspect(&handle).await.unwrap();
        assert!(snap.healthy);
        assert!(snap.started_at.is_some());
        let endpoint = rt.resolve_endpoint(&handle).await.unwrap().unwrap();
        assert_eq!(endpoint.host, "127.0.0.1");
        assert_eq!(Some(endpoint.port), snap.host_port);

        // second start is a no-op on a running process
        rt.start(&handle).await.unwrap();

        rt.stop(&handle).await.unwrap();
        let snap = rt.inspect(&handle).await.unwrap();
        assert!(!snap.healthy);
        assert!(snap.stopped_at.is_some());
        assert!(rt.resolve_endpoint(&handle).await.unwrap().is_none());

        rt.restart(&handle).await.unwrap();
        assert!(rt.inspect(&handle).await.unwrap().healthy);
        rt.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_taken_port_is_reallocated_on_start() {
        let rt = runtime();
        let handle = rt.create("alpha", &sleeper()).await.unwrap();
        let allocated = rt.inspect(&handle).await.unwrap().host_port.unwrap();
        let _squatter = std::net::TcpListener::bind(("127.0.0.1", allocated)).unwrap();

        rt.start(&handle).await.unwrap();
        let endpoint = rt.resolve_endpoint(&handle).await.unwrap().unwrap();
        assert_ne!(endpoint.port, allocated);
        assert_eq!(rt.inspect(&handle).await.unwrap().host_port, Some(endpoint.port));
        rt.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_exited_process_is_reported_unhealthy() {
        let rt = runtime();
        let spec = CreateSpec {
            command: vec!["true".into()],
            ..CreateSpec::default()
        };
        let handle = rt.create("short", &spec).await.unwrap();
        rt.start(&handle).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let snap = rt.inspect(&handle).await.unwrap();
        assert!(!snap.healthy);
        assert!(snap.error_message.unwrap().starts_with("process exited"));
    }

    #[tokio::test]
    async fn test_invalid_spec_and_unknown_handle() {
        let rt = runtime();
        let err = rt.create("empty", &CreateSpec::default()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Provision(_)));

        let missing = RuntimeHandle::new("local-missing");
        assert!(matches!(rt.inspect(&missing).await, Err(RuntimeError::NotFound(_))));
        assert!(matches!(rt.start(&missing).await, Err(RuntimeError::Lifecycle(_))));
    }

    #[test]
    fn test_parse_cpu_ticks_handles_spaces_in_comm() {
        let stat = "4242 (my bot (v2)) S 1 4242 4242 0 -1 4194560 100 0 0 0 250 50 0 0 20 0 1 0 100 0 0";
        assert_eq!(proc_stats::parse_cpu_ticks(stat), Some(300));
    }
}
