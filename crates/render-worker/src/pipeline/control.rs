//! Pause/resume/cancel control for one pipeline execution.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use render_media::{MediaError, MediaResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Completed | PipelineState::Failed | PipelineState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct ControlState {
    state: PipelineState,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

/// Shared handle to an execution's state machine.
///
/// Clones observe and drive the same execution. Waiters are woken through a
/// watch channel, so a resume or cancel takes effect immediately.
#[derive(Debug, Clone)]
pub struct PipelineControl {
    tx: Arc<watch::Sender<ControlState>>,
}

impl Default for PipelineControl {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineControl {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ControlState {
            state: PipelineState::Idle,
            paused_at: None,
            paused_total: Duration::ZERO,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> PipelineState {
        self.tx.borrow().state
    }

    /// Idle to running. No-op in any other state.
    pub fn start(&self) -> bool {
        self.transition(|s| {
            if s.state != PipelineState::Idle {
                return false;
            }
            s.state = PipelineState::Running;
            true
        })
    }

    /// Only effective while running.
    pub fn pause(&self) -> bool {
        self.transition(|s| {
            if s.state != PipelineState::Running {
                return false;
            }
            s.state = PipelineState::Paused;
            s.paused_at = Some(Instant::now());
            true
        })
    }

    /// Only effective while paused.
    pub fn resume(&self) -> bool {
        self.transition(|s| {
            if s.state != PipelineState::Paused {
                return false;
            }
            close_pause(s);
            s.state = PipelineState::Running;
            true
        })
    }

    /// Effective from idle, running or paused.
    pub fn cancel(&self) -> bool {
        self.transition(|s| {
            if s.state.is_terminal() {
                return false;
            }
            close_pause(s);
            s.state = PipelineState::Cancelled;
            true
        })
    }

    /// Record a terminal outcome. No-op once terminal.
    pub fn finish(&self, state: PipelineState) -> bool {
        self.transition(|s| {
            if s.state.is_terminal() || !state.is_terminal() {
                return false;
            }
            close_pause(s);
            s.state = state;
            true
        })
    }

    /// Total time spent paused, including a pause in progress.
    pub fn paused_duration(&self) -> Duration {
        let s = *self.tx.borrow();
        s.paused_total + s.paused_at.map_or(Duration::ZERO, |at| at.elapsed())
    }

    /// Block while paused; fail once cancelled.
    pub async fn checkpoint(&self) -> MediaResult<()> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|s| s.state != PipelineState::Paused)
            .await
            .map(|s| s.state)
            .unwrap_or(PipelineState::Cancelled);

        if state == PipelineState::Cancelled {
            Err(MediaError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the execution is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|s| s.state == PipelineState::Cancelled).await;
    }

    fn transition(&self, f: impl FnOnce(&mut ControlState) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }
}

fn close_pause(s: &mut ControlState) {
    if let Some(at) = s.paused_at.take() {
        s.paused_total += at.elapsed();
    }
}
