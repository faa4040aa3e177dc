use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sysinfo::{ProcessesToUpdate, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::metrics::{MetricValue, MetricsCollector};

/// Host and process metrics read through `sysinfo`
pub struct SystemCollector {
    system: Arc<Mutex<System>>,
    enabled: AtomicBool,
    last_update: RwLock<Option<DateTime<Utc>>>,
    interval: Duration,
}

impl SystemCollector {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(60))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            enabled: AtomicBool::new(true),
            last_update: RwLock::new(None),
            interval,
        }
    }
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw readings taken on the blocking pool
struct Snapshot {
    total_memory: u64,
    used_memory: u64,
    cpu_usage: f32,
    cpu_count: usize,
    process_count: usize,
    process_memory: Option<u64>,
    pid: Option<u32>,
}

fn read_snapshot(sys: &mut System) -> Snapshot {
    sys.refresh_memory();
    sys.refresh_cpu_usage();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let cpus = sys.cpus();
    let cpu_count = cpus.len();
    let cpu_usage = if cpu_count == 0 {
        0.0
    } else {
        cpus.iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / cpu_count as f32
    };

    let pid = sysinfo::get_current_pid().ok();
    let process_memory = pid.and_then(|pid| sys.process(pid)).map(|p| p.memory());

    Snapshot {
        total_memory: sys.total_memory(),
        used_memory: sys.used_memory(),
        cpu_usage,
        cpu_count,
        process_count: sys.processes().len(),
        process_memory,
        pid: pid.map(|pid| pid.as_u32()),
    }
}

#[async_trait]
impl MetricsCollector for SystemCollector {
    fn name(&self) -> &str {
        "system"
    }

    #[instrument(skip_all, fields(collector = "system"))]
    async fn collect(&self, cancel: &CancellationToken) -> anyhow::Result<Vec<MetricValue>> {
        let system = self.system.clone();
        let read = tokio::task::spawn_blocking(move || {
            let mut sys = system
                .lock()
                .map_err(|_| anyhow::anyhow!("system reader poisoned"))?;
            Ok::<_, anyhow::Error>(read_snapshot(&mut sys))
        });

        let snapshot = tokio::select! {
            biased;
            _ = cancel.cancelled() => anyhow::bail!("system collection cancelled"),
            joined = read => joined??,
        };

        let now = Utc::now();
        let tagged = |metric: MetricValue| metric.with_tag("collector", "system").at(now);

        let mut metrics = vec![
            tagged(
                MetricValue::gauge("system_memory_total_bytes", snapshot.total_memory as f64)
                    .with_description("Total system memory"),
            ),
            tagged(
                MetricValue::gauge("system_memory_used_bytes", snapshot.used_memory as f64)
                    .with_description("Used system memory"),
            ),
        ];

        if snapshot.total_memory > 0 {
            let percent = snapshot.used_memory as f64 / snapshot.total_memory as f64 * 100.0;
            metrics.push(tagged(
                MetricValue::gauge("system_memory_usage_percent", percent)
                    .with_description("Memory usage in percent"),
            ));
        }

        metrics.push(tagged(
            MetricValue::gauge("system_cpu_usage_percent", snapshot.cpu_usage as f64)
                .with_tag("cpus", snapshot.cpu_count.to_string())
                .with_description("Average CPU usage across cores"),
        ));
        metrics.push(tagged(
            MetricValue::gauge("system_process_count", snapshot.process_count as f64)
                .with_description("Number of running processes"),
        ));

        if let Some(memory) = snapshot.process_memory {
            metrics.push(tagged(
                MetricValue::gauge("system_process_memory_bytes", memory as f64)
                    .with_description("Resident memory of this process"),
            ));
        }
        if let Some(pid) = snapshot.pid {
            metrics.push(tagged(
                MetricValue::gauge("system_process_id", pid as f64)
                    .with_description("Process id of this service"),
            ));
        }

        if let Ok(mut last) = self.last_update.write() {
            *last = Some(now);
        }

        debug!("collected {} system metrics", metrics.len());
        Ok(metrics)
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update.read().ok().and_then(|last| *last)
    }

    fn collection_interval(&self) -> Duration {
        self.interval
    }
}
