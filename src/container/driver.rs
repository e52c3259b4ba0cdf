//! Streaming container run driver.
//!
//! Owns the three cooperating tasks of the run phase: the log observer
//! (with attach fallback), the stats observer, and the poll loop that owns
//! the deadline. Observers forward everything they see over one event
//! channel; a shared watch signal stops them on every exit path.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use super::runtime::{ChunkStream, ContainerRuntime, ContainerStat};
use crate::error::{Error, Result};

/// Error fragment docker emits when the logging driver forbids log reads.
const LOG_READ_UNSUPPORTED: &str = "does not support reading";

/// Cadence of the status poll loop.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One item observed during a container run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// A decoded stdout/stderr chunk.
    Log(String),
    /// A parsed resource sample.
    Stat(ContainerStat),
}

/// Final result of a streamed container run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Concatenation of every observed log chunk.
    pub logs: String,
    /// Exit code reported by the runtime (also set after a deadline stop).
    pub exit_code: i64,
}

/// Runs an already-started container to completion.
///
/// Log chunks and stats frames are forwarded over `events` while the poll
/// loop watches the container status on a 1 s cadence. When `deadline`
/// elapses the container is stopped and its exit code recorded; a timeout
/// is not an error. The container is force-removed on every exit path.
pub async fn run_to_completion(
    runtime: Arc<dyn ContainerRuntime>,
    container_id: &str,
    deadline: Duration,
    events: mpsc::Sender<RunEvent>,
) -> Result<RunOutcome> {
    let accumulator = Arc::new(Mutex::new(String::new()));
    let (stop_tx, stop_rx) = watch::channel(false);

    let logs_task = tokio::spawn(observe_logs(
        runtime.clone(),
        container_id.to_string(),
        accumulator.clone(),
        events.clone(),
        stop_rx.clone(),
    ));
    let stats_task = tokio::spawn(observe_stats(
        runtime.clone(),
        container_id.to_string(),
        events,
        stop_rx,
    ));

    let poll_result = poll_until_exit(runtime.as_ref(), container_id, deadline).await;

    let _ = stop_tx.send(true);
    let _ = logs_task.await;
    let _ = stats_task.await;

    if let Err(e) = runtime.remove_container(container_id).await {
        tracing::warn!(container_id, error = %e, "failed to remove container");
    }

    let exit_code = poll_result?;
    let logs = accumulator.lock().unwrap().clone();
    Ok(RunOutcome { logs, exit_code })
}

/// Status poll loop; returns the exit code once the container stops or the
/// deadline forces a stop.
async fn poll_until_exit(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    deadline: Duration,
) -> Result<i64> {
    let started = Instant::now();
    loop {
        let status = runtime.container_status(container_id).await?;
        if status.is_terminal() {
            return runtime.wait_exit(container_id).await;
        }
        if started.elapsed() >= deadline {
            tracing::info!(container_id, "deadline elapsed, stopping container");
            runtime.stop_container(container_id).await?;
            return runtime.wait_exit(container_id).await;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Why a chunk pump stopped.
enum PumpEnd {
    /// The stream ended normally.
    Complete,
    /// The logging driver refused reads; attach fallback applies.
    Unsupported,
    /// The stop signal fired.
    Stopped,
    /// Some other stream error.
    Failed(Error),
}

async fn observe_logs(
    runtime: Arc<dyn ContainerRuntime>,
    container_id: String,
    accumulator: Arc<Mutex<String>>,
    events: mpsc::Sender<RunEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let primary = runtime.log_stream(&container_id).await;
    match pump_chunks(primary, &accumulator, &events, &mut stop).await {
        PumpEnd::Unsupported => {
            tracing::info!(container_id, "logging driver refuses reads, attaching instead");
            let attach = runtime.attach_stream(&container_id).await;
            if let PumpEnd::Failed(e) = pump_chunks(attach, &accumulator, &events, &mut stop).await
            {
                tracing::warn!(container_id, error = %e, "attach fallback failed");
            }
        }
        PumpEnd::Failed(e) => {
            tracing::warn!(container_id, error = %e, "log stream failed");
        }
        PumpEnd::Complete | PumpEnd::Stopped => {}
    }
}

/// Forwards chunks until the stream ends, errors, or the stop signal fires.
/// Pending chunks are drained before the stop signal is honored.
async fn pump_chunks(
    stream: Result<ChunkStream>,
    accumulator: &Arc<Mutex<String>>,
    events: &mpsc::Sender<RunEvent>,
    stop: &mut watch::Receiver<bool>,
) -> PumpEnd {
    use futures_util::StreamExt;

    let mut stream = match stream {
        Ok(stream) => stream,
        Err(e) => return classify_stream_error(e),
    };

    loop {
        tokio::select! {
            biased;
            next = stream.next() => match next {
                Some(Ok(chunk)) => {
                    accumulator.lock().unwrap().push_str(&chunk);
                    let _ = events.send(RunEvent::Log(chunk)).await;
                }
                Some(Err(e)) => return classify_stream_error(e),
                None => return PumpEnd::Complete,
            },
            _ = stop.changed() => return PumpEnd::Stopped,
        }
    }
}

fn classify_stream_error(e: Error) -> PumpEnd {
    if e.to_string().to_lowercase().contains(LOG_READ_UNSUPPORTED) {
        PumpEnd::Unsupported
    } else {
        PumpEnd::Failed(e)
    }
}

async fn observe_stats(
    runtime: Arc<dyn ContainerRuntime>,
    container_id: String,
    events: mpsc::Sender<RunEvent>,
    mut stop: watch::Receiver<bool>,
) {
    use futures_util::StreamExt;

    let mut stream = match runtime.stats_stream(&container_id).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(container_id, error = %e, "stats stream unavailable");
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            next = stream.next() => match next {
                Some(Ok(frame)) => {
                    let _ = events.send(RunEvent::Stat(parse_stat_frame(&frame))).await;
                }
                Some(Err(e)) => {
                    tracing::warn!(container_id, error = %e, "stats stream failed");
                    return;
                }
                None => return,
            },
            _ = stop.changed() => return,
        }
    }
}

/// Parses one raw stats frame into a [`ContainerStat`].
///
/// CPU usage follows the engine's own formula:
/// `cpu_delta / system_delta * online_cpus * 100`. Network counters are
/// summed across all interfaces.
fn parse_stat_frame(frame: &serde_json::Value) -> ContainerStat {
    let int_at = |path: &str| frame.pointer(path).and_then(serde_json::Value::as_u64);

    let cpu_total = int_at("/cpu_stats/cpu_usage/total_usage").unwrap_or(0);
    let pre_total = int_at("/precpu_stats/cpu_usage/total_usage").unwrap_or(0);
    let system = int_at("/cpu_stats/system_cpu_usage").unwrap_or(0);
    let pre_system = int_at("/precpu_stats/system_cpu_usage").unwrap_or(0);

    let cpu_delta = cpu_total.saturating_sub(pre_total);
    let system_delta = system.saturating_sub(pre_system);
    let cpu_percent = if cpu_delta > 0 && system_delta > 0 {
        let online_cpus = int_at("/cpu_stats/online_cpus").filter(|n| *n > 0).unwrap_or(1);
        Some(cpu_delta as f64 / system_delta as f64 * online_cpus as f64 * 100.0)
    } else {
        None
    };

    let (mut net_rx, mut net_tx) = (0u64, 0u64);
    if let Some(networks) = frame.get("networks").and_then(|n| n.as_object()) {
        for interface in networks.values() {
            net_rx += interface.get("rx_bytes").and_then(|v| v.as_u64()).unwrap_or(0);
            net_tx += interface.get("tx_bytes").and_then(|v| v.as_u64()).unwrap_or(0);
        }
    }

    ContainerStat {
        cpu_percent,
        mem_usage: int_at("/memory_stats/usage"),
        mem_limit: int_at("/memory_stats/limit"),
        net_rx,
        net_tx,
    }
}
