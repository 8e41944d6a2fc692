use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Machine statistics gathered while a training function ran.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Statistics {
    /// The average one-minute load average throughout the run
    pub avg_load_average: f64,
    /// The maximum one-minute load average throughout the run
    pub max_load_average: f64,
    /// The maximum amount of RAM used, in bytes.
    pub max_ram_used: u64,
    /// How long the run took, in milliseconds.
    pub elapsed_ms: u64,
}

pub struct StatisticsTracker {
    close_tx: tokio::sync::oneshot::Sender<()>,
    task_handle: tokio::task::JoinHandle<Statistics>,
}

impl StatisticsTracker {
    pub async fn finish(self) -> Option<Statistics> {
        drop(self.close_tx);
        self.task_handle.await.ok()
    }
}

/// Start a task that samples system statistics every `interval`. Call
/// [StatisticsTracker::finish] to stop sampling and get the results.
pub fn track_system_stats(interval: Duration) -> StatisticsTracker {
    let (close_tx, mut close_rx) = tokio::sync::oneshot::channel();
    let task_handle = tokio::task::spawn(async move {
        let started = Instant::now();
        let mut system = System::new();

        let mut stats = Statistics {
            avg_load_average: 0.0,
            max_load_average: 0.0,
            max_ram_used: 0,
            elapsed_ms: 0,
        };

        let mut total_load_average = 0.0;
        let mut num_load_averages = 0;

        // The first tick completes immediately, so even short runs get one sample.
        let mut check_interval = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = check_interval.tick() => {
                    let load_avg = System::load_average();
                    total_load_average += load_avg.one;
                    num_load_averages += 1;
                    if load_avg.one > stats.max_load_average {
                        stats.max_load_average = load_avg.one;
                    }

                    system.refresh_memory_specifics(sysinfo::MemoryRefreshKind::new().with_ram());
                    let used_ram = system.used_memory();
                    if used_ram > stats.max_ram_used {
                        stats.max_ram_used = used_ram;
                    }
                }
                _ = &mut close_rx => {
                    break;
                }
            }
        }

        if num_load_averages > 0 {
            stats.avg_load_average = total_load_average / (num_load_averages as f64);
        }
        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        stats
    });

    StatisticsTracker {
        close_tx,
        task_handle,
    }
}
