// crates/quorum-orchestrator/src/resource.rs

//! System resource monitoring and adaptive concurrency.
//!
//! A sampler feeds `ResourceMetrics` into the optimiser, which classifies
//! each resource, publishes `OptimizationAction`s on a broadcast channel,
//! and maintains the single `current_concurrency` integer the orchestrator
//! sizes its dispatch semaphore from. Adjustments are one step at a time and
//! rate-limited by a cooldown. Tests drive the same path with synthetic
//! samples through [`ResourceOptimizer::ingest_sample`].

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use sysinfo::{Disks, System};
use tokio::sync::broadcast;

/// One sample of system state.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResourceMetrics {
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub mem_used_mb: f64,
    pub mem_available_mb: f64,
    pub disk_percent: f64,
    /// Open network connections; the sampler has no socket table, so this
    /// stays zero unless a host supplies it
    pub net_conns: usize,
    pub ts: DateTime<Utc>,
}

impl ResourceMetrics {
    /// Synthetic sample for tests and hosts with their own telemetry.
    pub fn synthetic(cpu_percent: f64, mem_percent: f64) -> Self {
        Self {
            cpu_percent,
            mem_percent,
            mem_used_mb: 0.0,
            mem_available_mb: 0.0,
            disk_percent: 0.0,
            net_conns: 0,
            ts: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResourceStatus {
    Optimal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OptimizationAction {
    ReduceConcurrency,
    IncreaseConcurrency,
    ClearCache,
    ForceGc,
}

/// Classification thresholds, in percent.
#[derive(Debug, Clone)]
pub struct ResourceThresholds {
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    /// CPU at or below this (with memory headroom) allows scaling up
    pub cpu_scale_up: f64,
    pub mem_warning: f64,
    pub mem_critical: f64,
    /// Memory must be below this for scale-up
    pub mem_scale_up_ceiling: f64,
    pub disk_warning: f64,
    pub disk_critical: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_warning: 70.0,
            cpu_critical: 85.0,
            cpu_scale_up: 40.0,
            mem_warning: 75.0,
            mem_critical: 90.0,
            mem_scale_up_ceiling: 70.0,
            disk_warning: 85.0,
            disk_critical: 95.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub min: usize,
    pub max: usize,
    pub step: usize,
    /// Minimum spacing between concurrency adjustments
    pub cooldown: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        let cores = num_cpus::get();
        Self {
            min: 1,
            max: (cores * 2).max(2),
            step: 1,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub thresholds: ResourceThresholds,
    pub concurrency: ConcurrencyConfig,
    pub monitoring_interval: Duration,
    /// Ring buffer length for metric history
    pub history_size: usize,
    /// Consecutive critical samples required before acting
    pub sustained_samples: u32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            thresholds: ResourceThresholds::default(),
            concurrency: ConcurrencyConfig::default(),
            monitoring_interval: Duration::from_secs(30),
            history_size: 120,
            sustained_samples: 2,
        }
    }
}

struct EvalState {
    consecutive_cpu_critical: u32,
    consecutive_mem_critical: u32,
    last_concurrency_change: Option<Instant>,
    last_memory_action: Option<Instant>,
}

pub struct ResourceOptimizer {
    config: OptimizerConfig,
    current: RwLock<Option<ResourceMetrics>>,
    history: Mutex<VecDeque<ResourceMetrics>>,
    concurrency: AtomicUsize,
    eval: Mutex<EvalState>,
    actions: broadcast::Sender<OptimizationAction>,
    system: Mutex<System>,
}

impl ResourceOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        let (actions, _) = broadcast::channel(64);
        let start = config.concurrency.max.max(config.concurrency.min);
        Self {
            config,
            current: RwLock::new(None),
            history: Mutex::new(VecDeque::new()),
            concurrency: AtomicUsize::new(start),
            eval: Mutex::new(EvalState {
                consecutive_cpu_critical: 0,
                consecutive_mem_critical: 0,
                last_concurrency_change: None,
                last_memory_action: None,
            }),
            actions,
            system: Mutex::new(System::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(OptimizerConfig::default())
    }

    /// The dispatch width the orchestrator should use right now. Always
    /// within `[min, max]`.
    pub fn current_concurrency(&self) -> usize {
        self.concurrency.load(Ordering::SeqCst)
    }

    /// Latest sample, non-blocking; `None` before the first sample lands.
    pub fn current_metrics(&self) -> Option<ResourceMetrics> {
        self.current.read().ok().and_then(|current| *current)
    }

    /// Last N samples, oldest first.
    pub fn history(&self) -> Vec<ResourceMetrics> {
        self.history
            .lock()
            .map(|history| history.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Receive optimisation actions as they are issued.
    pub fn subscribe_actions(&self) -> broadcast::Receiver<OptimizationAction> {
        self.actions.subscribe()
    }

    fn classify(value: f64, warning: f64, critical: f64) -> ResourceStatus {
        if value >= critical {
            ResourceStatus::Critical
        } else if value >= warning {
            ResourceStatus::Warning
        } else {
            ResourceStatus::Optimal
        }
    }

    /// Classification of the latest sample per resource.
    pub fn status(&self) -> Option<(ResourceStatus, ResourceStatus, ResourceStatus)> {
        let metrics = self.current_metrics()?;
        let t = &self.config.thresholds;
        Some((
            Self::classify(metrics.cpu_percent, t.cpu_warning, t.cpu_critical),
            Self::classify(metrics.mem_percent, t.mem_warning, t.mem_critical),
            Self::classify(metrics.disk_percent, t.disk_warning, t.disk_critical),
        ))
    }

    /// Feed one sample through classification and adaptation. Returns the
    /// actions taken, which are also published to subscribers.
    pub fn ingest_sample(&self, metrics: ResourceMetrics) -> Vec<OptimizationAction> {
        if let Ok(mut current) = self.current.write() {
            *current = Some(metrics);
        }
        if let Ok(mut history) = self.history.lock() {
            history.push_back(metrics);
            while history.len() > self.config.history_size {
                history.pop_front();
            }
        }

        let thresholds = &self.config.thresholds;
        let mut taken = Vec::new();
        let Ok(mut eval) = self.eval.lock() else {
            return taken;
        };

        if metrics.cpu_percent >= thresholds.cpu_critical {
            eval.consecutive_cpu_critical += 1;
        } else {
            eval.consecutive_cpu_critical = 0;
        }
        if metrics.mem_percent >= thresholds.mem_critical {
            eval.consecutive_mem_critical += 1;
        } else {
            eval.consecutive_mem_critical = 0;
        }

        if eval.consecutive_cpu_critical >= self.config.sustained_samples {
            if self.adjust_concurrency(&mut eval, -(self.config.concurrency.step as isize)) {
                warn!(
                    "CPU at {:.1}%, reducing concurrency to {}",
                    metrics.cpu_percent,
                    self.current_concurrency()
                );
                taken.push(OptimizationAction::ReduceConcurrency);
            }
        } else if metrics.cpu_percent <= thresholds.cpu_scale_up
            && metrics.mem_percent < thresholds.mem_scale_up_ceiling
        {
            if self.adjust_concurrency(&mut eval, self.config.concurrency.step as isize) {
                debug!(
                    "headroom available, raising concurrency to {}",
                    self.current_concurrency()
                );
                taken.push(OptimizationAction::IncreaseConcurrency);
            }
        }

        if eval.consecutive_mem_critical >= self.config.sustained_samples {
            let due = eval
                .last_memory_action
                .map(|at| at.elapsed() >= self.config.concurrency.cooldown)
                .unwrap_or(true);
            if due {
                warn!("memory at {:.1}%, requesting cache clear", metrics.mem_percent);
                eval.last_memory_action = Some(Instant::now());
                taken.push(OptimizationAction::ClearCache);
                taken.push(OptimizationAction::ForceGc);
            }
        }

        drop(eval);
        for action in &taken {
            let _ = self.actions.send(*action);
        }
        taken
    }

    /// One bounded step, gated by the cooldown. Returns whether anything
    /// changed.
    fn adjust_concurrency(&self, eval: &mut EvalState, delta: isize) -> bool {
        let due = eval
            .last_concurrency_change
            .map(|at| at.elapsed() >= self.config.concurrency.cooldown)
            .unwrap_or(true);
        if !due {
            return false;
        }
        let bounds = &self.config.concurrency;
        let current = self.concurrency.load(Ordering::SeqCst) as isize;
        let next = (current + delta).clamp(bounds.min as isize, bounds.max as isize) as usize;
        if next == current as usize {
            return false;
        }
        self.concurrency.store(next, Ordering::SeqCst);
        eval.last_concurrency_change = Some(Instant::now());
        true
    }

    /// Sample the host via sysinfo and feed the optimiser.
    pub fn sample_now(&self) -> Option<ResourceMetrics> {
        let metrics = {
            let mut system = self.system.lock().ok()?;
            system.refresh_cpu_usage();
            system.refresh_memory();

            let total = system.total_memory() as f64;
            let used = system.used_memory() as f64;
            let available = system.available_memory() as f64;
            let mem_percent = if total > 0.0 { used / total * 100.0 } else { 0.0 };

            let disks = Disks::new_with_refreshed_list();
            let disk_percent = disks
                .iter()
                .filter(|disk| disk.total_space() > 0)
                .map(|disk| {
                    let total = disk.total_space() as f64;
                    (total - disk.available_space() as f64) / total * 100.0
                })
                .fold(0.0_f64, f64::max);

            ResourceMetrics {
                cpu_percent: system.global_cpu_usage() as f64,
                mem_percent,
                mem_used_mb: used / (1024.0 * 1024.0),
                mem_available_mb: available / (1024.0 * 1024.0),
                disk_percent,
                net_conns: 0,
                ts: Utc::now(),
            }
        };
        self.ingest_sample(metrics);
        Some(metrics)
    }

    /// Periodic sampling loop. The returned handle aborts the loop on drop
    /// of the owning task.
    pub fn spawn_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let optimizer = Arc::clone(self);
        info!(
            "resource monitor sampling every {:?}",
            optimizer.config.monitoring_interval
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(optimizer.config.monitoring_interval);
            loop {
                ticker.tick().await;
                let sampled = {
                    let optimizer = Arc::clone(&optimizer);
                    tokio::task::spawn_blocking(move || optimizer.sample_now()).await
                };
                if sampled.is_err() {
                    warn!("resource sampling task failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_optimizer(max: usize, cooldown: Duration) -> ResourceOptimizer {
        ResourceOptimizer::new(OptimizerConfig {
            concurrency: ConcurrencyConfig {
                min: 1,
                max,
                step: 1,
                cooldown,
            },
            ..Default::default()
        })
    }

    #[test]
    fn sustained_cpu_pressure_steps_down_once() {
        let optimizer = fast_optimizer(8, Duration::from_secs(60));
        assert_eq!(optimizer.current_concurrency(), 8);

        // First critical sample: below the sustained requirement, no action.
        let actions = optimizer.ingest_sample(ResourceMetrics::synthetic(95.0, 50.0));
        assert!(actions.is_empty());
        assert_eq!(optimizer.current_concurrency(), 8);

        // Second consecutive critical sample: one step down.
        let actions = optimizer.ingest_sample(ResourceMetrics::synthetic(95.0, 50.0));
        assert_eq!(actions, vec![OptimizationAction::ReduceConcurrency]);
        assert_eq!(optimizer.current_concurrency(), 7);

        // Still critical, but the cooldown blocks further changes.
        let actions = optimizer.ingest_sample(ResourceMetrics::synthetic(95.0, 50.0));
        assert!(actions.is_empty());
        assert_eq!(optimizer.current_concurrency(), 7);
    }

    #[test]
    fn concurrency_steps_up_after_cooldown_with_headroom() {
        let optimizer = fast_optimizer(4, Duration::from_millis(1));
        optimizer.ingest_sample(ResourceMetrics::synthetic(95.0, 50.0));
        optimizer.ingest_sample(ResourceMetrics::synthetic(95.0, 50.0));
        assert_eq!(optimizer.current_concurrency(), 3);

        std::thread::sleep(Duration::from_millis(5));
        let actions = optimizer.ingest_sample(ResourceMetrics::synthetic(10.0, 30.0));
        assert_eq!(actions, vec![OptimizationAction::IncreaseConcurrency]);
        assert_eq!(optimizer.current_concurrency(), 4);

        // Already at the ceiling: quiet samples change nothing.
        std::thread::sleep(Duration::from_millis(5));
        assert!(optimizer.ingest_sample(ResourceMetrics::synthetic(10.0, 30.0)).is_empty());
        assert_eq!(optimizer.current_concurrency(), 4);
    }

    #[test]
    fn concurrency_never_leaves_bounds() {
        let optimizer = fast_optimizer(2, Duration::from_millis(1));
        for _ in 0..10 {
            optimizer.ingest_sample(ResourceMetrics::synthetic(95.0, 50.0));
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(optimizer.current_concurrency() >= 1);

        for _ in 0..10 {
            optimizer.ingest_sample(ResourceMetrics::synthetic(5.0, 20.0));
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(optimizer.current_concurrency() <= 2);
    }

    #[test]
    fn memory_pressure_requests_cache_clear() {
        let optimizer = fast_optimizer(4, Duration::from_secs(60));
        let mut receiver = optimizer.subscribe_actions();

        optimizer.ingest_sample(ResourceMetrics::synthetic(10.0, 95.0));
        let actions = optimizer.ingest_sample(ResourceMetrics::synthetic(10.0, 95.0));
        assert!(actions.contains(&OptimizationAction::ClearCache));
        assert!(actions.contains(&OptimizationAction::ForceGc));

        assert_eq!(receiver.try_recv().unwrap(), OptimizationAction::ClearCache);
        assert_eq!(receiver.try_recv().unwrap(), OptimizationAction::ForceGc);
    }

    #[test]
    fn interrupted_pressure_resets_the_streak() {
        let optimizer = fast_optimizer(8, Duration::from_millis(1));
        optimizer.ingest_sample(ResourceMetrics::synthetic(95.0, 50.0));
        optimizer.ingest_sample(ResourceMetrics::synthetic(50.0, 50.0));
        optimizer.ingest_sample(ResourceMetrics::synthetic(95.0, 50.0));
        // Never two consecutive critical samples, so nothing happened.
        assert_eq!(optimizer.current_concurrency(), 8);
    }

    #[test]
    fn history_is_ring_buffered() {
        let optimizer = ResourceOptimizer::new(OptimizerConfig {
            history_size: 3,
            ..Default::default()
        });
        for i in 0..5 {
            optimizer.ingest_sample(ResourceMetrics::synthetic(i as f64, 0.0));
        }
        let history = optimizer.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].cpu_percent, 2.0);
        assert_eq!(history[2].cpu_percent, 4.0);
    }

    #[test]
    fn live_sampling_produces_plausible_numbers() {
        let optimizer = ResourceOptimizer::with_defaults();
        let metrics = optimizer.sample_now().unwrap();
        assert!(metrics.mem_percent >= 0.0 && metrics.mem_percent <= 100.0);
        assert!(metrics.cpu_percent >= 0.0);
        assert!(optimizer.current_metrics().is_some());
    }
}
