use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};

use crate::error::SamplingError;

/// Minimum age of the cached snapshot before the host is sampled again.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const BYTES_PER_MIB: u64 = 1024 * 1024;

// ─── Snapshot types ──────────────────────────────────────────────

/// Point-in-time host resource usage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSnapshot {
    pub cpu_percent: f64,
    pub memory_total_gb: f64,
    pub memory_used_gb: f64,
    pub memory_percent: f64,
    pub disk_total_gb: f64,
    pub disk_used_gb: f64,
    pub disk_percent: f64,
    pub gpu_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_memory_allocated_gb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_memory_reserved_gb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_error: Option<String>,
    pub sampled_at: DateTime<Utc>,
}

/// Raw host figures in bytes, before conversion to the report shape.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostUsage {
    pub cpu_percent: f32,
    pub memory_total: u64,
    pub memory_used: u64,
    pub disk_total: u64,
    pub disk_used: u64,
}

/// Memory figures for the first accelerator device.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceleratorMemory {
    pub name: String,
    pub allocated_bytes: u64,
    pub reserved_bytes: u64,
}

impl SystemSnapshot {
    /// Compose a snapshot. An accelerator failure becomes `gpu_error`
    /// with `gpu_available: false`; it never fails the snapshot.
    pub fn from_parts(
        host: HostUsage,
        accelerator: Result<Option<AcceleratorMemory>, SamplingError>,
    ) -> Self {
        let mut snapshot = Self {
            cpu_percent: f64::from(host.cpu_percent),
            memory_total_gb: to_gb(host.memory_total),
            memory_used_gb: to_gb(host.memory_used),
            memory_percent: percent(host.memory_used, host.memory_total),
            disk_total_gb: to_gb(host.disk_total),
            disk_used_gb: to_gb(host.disk_used),
            disk_percent: percent(host.disk_used, host.disk_total),
            gpu_available: false,
            gpu_memory_allocated_gb: None,
            gpu_memory_reserved_gb: None,
            gpu_name: None,
            gpu_error: None,
            sampled_at: Utc::now(),
        };

        match accelerator {
            Ok(Some(gpu)) => {
                snapshot.gpu_available = true;
                snapshot.gpu_memory_allocated_gb = Some(to_gb(gpu.allocated_bytes));
                snapshot.gpu_memory_reserved_gb = Some(to_gb(gpu.reserved_bytes));
                snapshot.gpu_name = Some(gpu.name);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "accelerator sampling failed");
                snapshot.gpu_error = Some(e.to_string());
            }
        }

        snapshot
    }
}

fn to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

// ─── Probes ──────────────────────────────────────────────────────

/// Performs one real (uncached) resource sample.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> SystemSnapshot;
}

/// Reads accelerator memory. `Ok(None)` means no accelerator is present.
pub trait AcceleratorProbe: Send + Sync {
    fn query(&self) -> Result<Option<AcceleratorMemory>, SamplingError>;
}

/// Environment without an accelerator.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAccelerator;

impl AcceleratorProbe for NoAccelerator {
    fn query(&self) -> Result<Option<AcceleratorMemory>, SamplingError> {
        Ok(None)
    }
}

/// Default deadline for one `nvidia-smi` invocation.
pub const DEFAULT_ACCELERATOR_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Queries device 0 through `nvidia-smi`.
///
/// `allocated` is the device's used memory, `reserved` the memory held back
/// by the driver. With `required == false` a missing binary is read as
/// "no accelerator"; otherwise it is a sampling error. A child still running
/// at the deadline is killed and reported as [`SamplingError::Timeout`].
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    program: String,
    launcher_args: Vec<String>,
    required: bool,
    timeout: Duration,
}

impl NvidiaSmi {
    const COMMAND: &'static str = "nvidia-smi";

    pub fn new(required: bool) -> Self {
        Self {
            program: Self::COMMAND.to_owned(),
            launcher_args: Vec::new(),
            required,
            timeout: DEFAULT_ACCELERATOR_TIMEOUT,
        }
    }

    /// Run the query through another program, e.g.
    /// `docker exec gpu-node nvidia-smi`. The query flags are appended
    /// after `args`.
    pub fn with_command<I, S>(mut self, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program = program.into();
        self.launcher_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Spawn the query and wait for it, at most until the deadline.
    fn run(&self) -> Result<Option<Output>, SamplingError> {
        let spawned = Command::new(&self.program)
            .args(&self.launcher_args)
            .args([
                "--query-gpu=name,memory.used,memory.reserved",
                "--format=csv,noheader,nounits",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return if self.required {
                    Err(SamplingError::CommandUnavailable(Self::COMMAND))
                } else {
                    Ok(None)
                };
            }
            Err(e) => return Err(e.into()),
        };

        let started = Instant::now();
        loop {
            if child.try_wait()?.is_some() {
                return Ok(Some(child.wait_with_output()?));
            }
            if started.elapsed() >= self.timeout {
                // kill fails only if the child exited in the meantime
                let _ = child.kill();
                let _ = child.wait();
                return Err(SamplingError::Timeout {
                    command: Self::COMMAND,
                    after: self.timeout,
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl AcceleratorProbe for NvidiaSmi {
    fn query(&self) -> Result<Option<AcceleratorMemory>, SamplingError> {
        let Some(output) = self.run()? else {
            return Ok(None);
        };

        if !output.status.success() {
            return Err(SamplingError::CommandFailed {
                command: Self::COMMAND,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `name, used_mib, reserved_mib` CSV; only the first device is read.
pub fn parse_nvidia_smi(stdout: &str) -> Result<Option<AcceleratorMemory>, SamplingError> {
    let Some(line) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return Ok(None);
    };

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let [name, used, reserved] = fields.as_slice() else {
        return Err(SamplingError::Parse(line.to_owned()));
    };
    let mib = |s: &str| {
        s.parse::<u64>()
            .ok()
            .and_then(|v| v.checked_mul(BYTES_PER_MIB))
            .ok_or_else(|| SamplingError::Parse(line.to_owned()))
    };

    Ok(Some(AcceleratorMemory {
        name: (*name).to_owned(),
        allocated_bytes: mib(*used)?,
        reserved_bytes: mib(*reserved)?,
    }))
}

/// Samples the local host through `sysinfo`.
///
/// The `System` handle is kept between samples so CPU usage is measured
/// over the interval since the previous refresh. The first reading after
/// construction may therefore be 0.
pub struct HostProbe {
    system: Mutex<System>,
    accelerator: Box<dyn AcceleratorProbe>,
}

impl HostProbe {
    pub fn new(accelerator: Box<dyn AcceleratorProbe>) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::nothing().with_cpu_usage())
                .with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            system: Mutex::new(system),
            accelerator,
        }
    }

    fn host_usage(&self) -> HostUsage {
        let (cpu_percent, memory_total, memory_used) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();
            (
                system.global_cpu_usage(),
                system.total_memory(),
                system.used_memory(),
            )
        };

        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .list()
            .iter()
            .find(|d| d.mount_point() == Path::new("/"))
            .or_else(|| disks.list().first());
        let (disk_total, disk_used) = root.map_or((0, 0), |d| {
            (
                d.total_space(),
                d.total_space().saturating_sub(d.available_space()),
            )
        });

        HostUsage {
            cpu_percent,
            memory_total,
            memory_used,
            disk_total,
            disk_used,
        }
    }
}

impl ResourceProbe for HostProbe {
    fn sample(&self) -> SystemSnapshot {
        SystemSnapshot::from_parts(self.host_usage(), self.accelerator.query())
    }
}

// ─── Cache-gated sampler ─────────────────────────────────────────

struct CachedSnapshot {
    taken_at: Instant,
    snapshot: SystemSnapshot,
}

/// Serves the last snapshot until it is `refresh_interval` old.
///
/// Refreshes are single-flight: the caller that finds the cache stale
/// samples while every other caller keeps getting the previous snapshot.
/// Only the very first sample makes concurrent callers wait.
pub struct SystemSampler {
    probe: Box<dyn ResourceProbe>,
    refresh_interval: Duration,
    cache: RwLock<Option<CachedSnapshot>>,
    refresh: Mutex<()>,
}

impl SystemSampler {
    pub fn new(probe: Box<dyn ResourceProbe>, refresh_interval: Duration) -> Self {
        Self {
            probe,
            refresh_interval,
            cache: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    pub fn sample(&self) -> SystemSnapshot {
        let stale = match self.cache.read().as_ref() {
            Some(cached) if cached.taken_at.elapsed() < self.refresh_interval => {
                return cached.snapshot.clone();
            }
            cached => cached.map(|c| c.snapshot.clone()),
        };

        let _refresh = match (self.refresh.try_lock(), stale) {
            (Some(guard), _) => guard,
            (None, Some(previous)) => return previous,
            (None, None) => {
                let guard = self.refresh.lock();
                if let Some(cached) = self.cache.read().as_ref() {
                    return cached.snapshot.clone();
                }
                guard
            }
        };

        // Sample outside the cache lock so readers never wait on the OS
        let snapshot = self.probe.sample();
        *self.cache.write() = Some(CachedSnapshot {
            taken_at: Instant::now(),
            snapshot: snapshot.clone(),
        });
        tracing::trace!(cpu = snapshot.cpu_percent, "system snapshot refreshed");
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Returns a different CPU figure on every real sample.
    struct CountingProbe {
        calls: Arc<AtomicUsize>,
    }

    impl ResourceProbe for CountingProbe {
        fn sample(&self) -> SystemSnapshot {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            SystemSnapshot::from_parts(
                HostUsage {
                    cpu_percent: n as f32,
                    ..HostUsage::default()
                },
                Ok(None),
            )
        }
    }

    fn counting_sampler(interval: Duration) -> (SystemSampler, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = CountingProbe {
            calls: calls.clone(),
        };
        (SystemSampler::new(Box::new(probe), interval), calls)
    }

    #[test]
    fn test_cache_hit_within_interval() {
        let (sampler, calls) = counting_sampler(Duration::from_secs(60));
        let first = sampler.sample();
        let second = sampler.sample();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resample_after_interval() {
        let (sampler, calls) = counting_sampler(Duration::from_millis(20));
        let first = sampler.sample();
        std::thread::sleep(Duration::from_millis(40));
        let second = sampler.sample();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_ne!(first.cpu_percent, second.cpu_percent);
    }

    #[test]
    fn test_from_parts_converts_units() {
        let snapshot = SystemSnapshot::from_parts(
            HostUsage {
                cpu_percent: 12.5,
                memory_total: 8 * 1024 * 1024 * 1024,
                memory_used: 2 * 1024 * 1024 * 1024,
                disk_total: 100 * 1024 * 1024 * 1024,
                disk_used: 25 * 1024 * 1024 * 1024,
            },
            Ok(Some(AcceleratorMemory {
                name: "Test GPU".into(),
                allocated_bytes: 1024 * 1024 * 1024,
                reserved_bytes: 512 * 1024 * 1024,
            })),
        );

        assert_eq!(snapshot.cpu_percent, 12.5);
        assert_eq!(snapshot.memory_total_gb, 8.0);
        assert_eq!(snapshot.memory_percent, 25.0);
        assert_eq!(snapshot.disk_percent, 25.0);
        assert!(snapshot.gpu_available);
        assert_eq!(snapshot.gpu_memory_allocated_gb, Some(1.0));
        assert_eq!(snapshot.gpu_memory_reserved_gb, Some(0.5));
        assert_eq!(snapshot.gpu_name.as_deref(), Some("Test GPU"));
    }

    #[test]
    fn test_zero_totals_do_not_divide() {
        let snapshot = SystemSnapshot::from_parts(HostUsage::default(), Ok(None));
        assert_eq!(snapshot.memory_percent, 0.0);
        assert_eq!(snapshot.disk_percent, 0.0);
        assert!(!snapshot.gpu_available);
    }

    #[test]
    fn test_accelerator_failure_is_field_level() {
        let snapshot = SystemSnapshot::from_parts(
            HostUsage::default(),
            Err(SamplingError::CommandUnavailable("nvidia-smi")),
        );

        assert!(!snapshot.gpu_available);
        assert_eq!(
            snapshot.gpu_error.as_deref(),
            Some("nvidia-smi is not installed")
        );

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["gpu_available"], false);
        assert!(json.get("gpu_name").is_none());
    }

    #[test]
    fn test_parse_nvidia_smi() {
        let parsed = parse_nvidia_smi("NVIDIA A100-SXM4-40GB, 2048, 512\nOther, 1, 1\n")
            .unwrap()
            .unwrap();
        assert_eq!(parsed.name, "NVIDIA A100-SXM4-40GB");
        assert_eq!(parsed.allocated_bytes, 2048 * BYTES_PER_MIB);
        assert_eq!(parsed.reserved_bytes, 512 * BYTES_PER_MIB);

        assert!(parse_nvidia_smi("\n").unwrap().is_none());
        assert!(matches!(
            parse_nvidia_smi("gpu, [N/A], 3"),
            Err(SamplingError::Parse(_))
        ));
        assert!(matches!(
            parse_nvidia_smi("only-a-name"),
            Err(SamplingError::Parse(_))
        ));
    }

    #[test]
    fn test_host_probe_reads_memory() {
        let probe = HostProbe::new(Box::new(NoAccelerator));
        let snapshot = probe.sample();

        assert!(snapshot.memory_total_gb > 0.0);
        assert!(snapshot.cpu_percent >= 0.0);
        assert!(!snapshot.gpu_available);
    }

    #[test]
    fn test_parse_rejects_overflowing_mib() {
        assert!(matches!(
            parse_nvidia_smi("gpu, 18446744073709551615, 1"),
            Err(SamplingError::Parse(_))
        ));
    }

    /// Takes `delay` per sample, like a host with a wedged driver.
    struct SlowProbe {
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl ResourceProbe for SlowProbe {
        fn sample(&self) -> SystemSnapshot {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::thread::sleep(self.delay);
            SystemSnapshot::from_parts(
                HostUsage {
                    cpu_percent: n as f32,
                    ..HostUsage::default()
                },
                Ok(None),
            )
        }
    }

    fn slow_sampler(delay: Duration, interval: Duration) -> (Arc<SystemSampler>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = SlowProbe {
            calls: calls.clone(),
            delay,
        };
        (Arc::new(SystemSampler::new(Box::new(probe), interval)), calls)
    }

    /// Runs `sample()` on `n` threads released together; returns each
    /// caller's snapshot and wait time.
    fn sample_concurrently(sampler: &Arc<SystemSampler>, n: usize) -> Vec<(SystemSnapshot, Duration)> {
        let barrier = Arc::new(std::sync::Barrier::new(n));
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let sampler = sampler.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let started = Instant::now();
                    let snapshot = sampler.sample();
                    (snapshot, started.elapsed())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_stale_readers_do_not_wait_for_refresh() {
        let delay = Duration::from_millis(200);
        let (sampler, calls) = slow_sampler(delay, Duration::from_millis(300));
        sampler.sample();
        std::thread::sleep(Duration::from_millis(350));

        let results = sample_concurrently(&sampler, 4);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let waited: Vec<_> = results.iter().filter(|(_, took)| *took >= delay).collect();
        assert_eq!(waited.len(), 1);
        assert_eq!(waited[0].0.cpu_percent, 2.0);
        let served_stale = results
            .iter()
            .filter(|(s, took)| *took < Duration::from_millis(100) && s.cpu_percent == 1.0)
            .count();
        assert_eq!(served_stale, 3);
    }

    #[test]
    fn test_first_sample_is_taken_once() {
        let (sampler, calls) = slow_sampler(Duration::from_millis(100), Duration::from_secs(60));

        let results = sample_concurrently(&sampler, 4);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|(s, _)| s.cpu_percent == 1.0));
    }

    #[test]
    fn test_missing_nvidia_smi() {
        let missing = "/nonexistent/bin/nvidia-smi";

        let optional = NvidiaSmi::new(false).with_command(missing, Vec::<String>::new());
        assert!(optional.query().unwrap().is_none());

        let required = NvidiaSmi::new(true).with_command(missing, Vec::<String>::new());
        assert!(matches!(
            required.query(),
            Err(SamplingError::CommandUnavailable("nvidia-smi"))
        ));
    }

    #[cfg(unix)]
    fn fake_nvidia_smi(script: &str) -> NvidiaSmi {
        NvidiaSmi::new(true).with_command("sh", ["-c", script])
    }

    #[cfg(unix)]
    #[test]
    fn test_nvidia_smi_output_is_parsed() {
        let gpu = fake_nvidia_smi("echo 'Tesla T4, 1024, 256'")
            .query()
            .unwrap()
            .unwrap();
        assert_eq!(gpu.name, "Tesla T4");
        assert_eq!(gpu.allocated_bytes, 1024 * BYTES_PER_MIB);
        assert_eq!(gpu.reserved_bytes, 256 * BYTES_PER_MIB);
    }

    #[cfg(unix)]
    #[test]
    fn test_nvidia_smi_nonzero_exit() {
        let err = fake_nvidia_smi("echo 'NVIDIA-SMI has failed' >&2; exit 9")
            .query()
            .unwrap_err();

        match err {
            SamplingError::CommandFailed {
                command, stderr, ..
            } => {
                assert_eq!(command, "nvidia-smi");
                assert_eq!(stderr, "NVIDIA-SMI has failed");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_hung_nvidia_smi_is_killed_at_deadline() {
        let probe = fake_nvidia_smi("exec sleep 10").with_timeout(Duration::from_millis(150));

        let started = Instant::now();
        let err = probe.query().unwrap_err();

        assert!(matches!(err, SamplingError::Timeout { command: "nvidia-smi", .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn test_hung_accelerator_becomes_gpu_error() {
        let accelerator = NvidiaSmi::new(false)
            .with_command("sh", ["-c", "exec sleep 10"])
            .with_timeout(Duration::from_millis(150));
        let sampler = Arc::new(SystemSampler::new(
            Box::new(HostProbe::new(Box::new(accelerator))),
            Duration::from_secs(60),
        ));

        let started = Instant::now();
        let results = sample_concurrently(&sampler, 4);

        assert!(started.elapsed() < Duration::from_secs(5));
        for (snapshot, _) in &results {
            assert!(!snapshot.gpu_available);
            assert_eq!(
                snapshot.gpu_error.as_deref(),
                Some("nvidia-smi timed out after 150ms")
            );
        }
    }
}
