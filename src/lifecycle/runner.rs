//! Running one phase container to completion

use super::Phase;
use crate::engine::{ContainerEngine, ContainerSpec, LogReader, LogStreams};
use crate::error::{KilnError, KilnResult};
use futures_util::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Max number of output lines kept for error messages
pub const OUTPUT_TAIL_LINES: usize = 50;

/// Receives every line a phase container prints
pub type OutputSink = Arc<dyn Fn(Phase, &str) + Send + Sync>;

/// Sink that logs container output at debug level
pub fn log_sink() -> OutputSink {
    Arc::new(|phase, line| debug!("[{}] {}", phase, line))
}

/// The last lines of combined container output
#[derive(Debug, Default)]
pub struct OutputTail {
    lines: VecDeque<String>,
}

impl OutputTail {
    pub fn push(&mut self, line: String) {
        if self.lines.len() == OUTPUT_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn render(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Run `fut` unless `cancel` fires first
pub async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = KilnResult<T>>,
) -> KilnResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(KilnError::Cancelled),
        result = fut => result,
    }
}

/// Create a container, hand its ID to `body`, and remove it afterwards.
///
/// Removal happens on success, error, cancellation and panic. A panic in
/// `body` is re-raised once the container is gone.
pub async fn with_container<T, F, Fut>(
    engine: &dyn ContainerEngine,
    spec: &ContainerSpec,
    cancel: &CancellationToken,
    body: F,
) -> KilnResult<T>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = KilnResult<T>>,
{
    let id = match cancellable(cancel, engine.create_container(spec)).await {
        Ok(id) => id,
        Err(KilnError::Cancelled) => {
            // The engine may have finished creating it before the call was dropped
            if let Err(e) = engine.remove_container(&spec.name).await {
                warn!("Failed to remove container {}: {}", spec.name, e);
            }
            return Err(KilnError::Cancelled);
        }
        Err(e) => return Err(e),
    };

    let outcome = AssertUnwindSafe(body(id.clone())).catch_unwind().await;

    if let Err(e) = engine.remove_container(&id).await {
        warn!("Failed to remove container {}: {}", spec.name, e);
    }

    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Aborts the output drain tasks when dropped, including when the phase
/// future itself is dropped mid-wait
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

async fn drain(reader: LogReader, phase: Phase, sink: OutputSink, tail: Arc<Mutex<OutputTail>>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        sink(phase, &line);
        if let Ok(mut tail) = tail.lock() {
            tail.push(line);
        }
    }
}

/// Start a created container, stream its output and wait for it to exit.
///
/// Two tasks drain stdout and stderr while the exit status is awaited. Both
/// are finished, or aborted and awaited, before this returns.
pub async fn run_to_completion(
    engine: &dyn ContainerEngine,
    id: &str,
    phase: Phase,
    sink: &OutputSink,
    cancel: &CancellationToken,
) -> KilnResult<()> {
    cancellable(cancel, engine.start(id)).await?;
    let LogStreams {
        stdout,
        stderr,
        guard,
    } = cancellable(cancel, engine.stream_logs(id)).await?;

    let tail = Arc::new(Mutex::new(OutputTail::default()));
    let out_task = tokio::spawn(drain(stdout, phase, Arc::clone(sink), Arc::clone(&tail)));
    let err_task = tokio::spawn(drain(stderr, phase, Arc::clone(sink), Arc::clone(&tail)));
    let aborts = AbortOnDrop(vec![out_task.abort_handle(), err_task.abort_handle()]);

    let drains = async move {
        let _ = out_task.await;
        let _ = err_task.await;
    };
    tokio::pin!(drains);

    let waited = cancellable(cancel, engine.wait(id)).await;

    let finished = match waited {
        Ok(_) => {
            tokio::select! {
                _ = &mut drains => true,
                _ = cancel.cancelled() => false,
            }
        }
        Err(_) => false,
    };
    if !finished {
        drop(aborts);
        (&mut drains).await;
    }
    drop(guard);

    let code = match waited {
        Ok(code) => code,
        Err(e) => return Err(e),
    };
    if !finished {
        return Err(KilnError::Cancelled);
    }

    if code == 0 {
        debug!("{} phase container exited cleanly", phase);
        Ok(())
    } else {
        let output = tail.lock().map(|t| t.render()).unwrap_or_default();
        Err(KilnError::PhaseFailed {
            phase,
            code,
            output,
        })
    }
}
