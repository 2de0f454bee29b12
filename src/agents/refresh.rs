//! Adaptive refresh-rate agent
//!
//! A static screen does not need 165 Hz. A capture worker (owned by the
//! engine, not this agent) samples a downsampled frame every 2 s and feeds
//! the similarity between successive frames into a shared signal. The
//! agent runs a small state machine over that signal:
//!
//! `Normal` --(similarity ≥ 0.99 for 10 s)--> `Static` (collapse to the
//! lowest available rate); any sample below 0.99 restores the native rate
//! on the same tick and returns to `Normal`.
//!
//! Proposals respect the override registry: a user-chosen rate pauses the
//! agent for the cooling period.

use crate::action::{Action, ActionValue, ControlTarget, Priority, Proposal};
use crate::agents::{Agent, AgentContext};
use crate::hal::display::Frame;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Frames at or above this similarity count as static.
pub const STATIC_SIMILARITY: f64 = 0.99;
/// Seconds of sustained static content before collapsing the rate.
pub const STATIC_HOLD: Duration = Duration::from_secs(10);
/// Capture cadence of the worker.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// Latest detector output, shared between the capture worker and the agent.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshSignal {
    pub last_similarity: Option<f64>,
    /// How long the screen has been continuously static.
    pub static_for: Duration,
    pub updated_at: Option<Instant>,
}

/// Compares successive frames and accumulates static time. Driven by the
/// engine's capture worker; never called from `propose`.
pub struct StaticScreenDetector {
    previous: Option<Frame>,
    static_since: Option<Instant>,
    signal: Arc<Mutex<RefreshSignal>>,
}

impl StaticScreenDetector {
    pub fn new() -> Self {
        Self {
            previous: None,
            static_since: None,
            signal: Arc::new(Mutex::new(RefreshSignal::default())),
        }
    }

    pub fn signal(&self) -> Arc<Mutex<RefreshSignal>> {
        self.signal.clone()
    }

    /// Ingest one captured frame; updates the shared signal.
    pub fn ingest(&mut self, frame: Frame) {
        let now = Instant::now();
        let similarity = self
            .previous
            .as_ref()
            .and_then(|prev| prev.similarity(&frame));

        match similarity {
            Some(s) if s >= STATIC_SIMILARITY => {
                if self.static_since.is_none() {
                    self.static_since = Some(now);
                }
            }
            Some(_) => self.static_since = None,
            // Geometry change (display switch) resets the run.
            None => self.static_since = None,
        }
        self.previous = Some(frame);

        let mut signal = self.signal.lock().unwrap_or_else(|e| e.into_inner());
        signal.last_similarity = similarity;
        signal.static_for = self
            .static_since
            .map(|since| now.duration_since(since))
            .unwrap_or(Duration::ZERO);
        signal.updated_at = Some(now);
    }
}

impl Default for StaticScreenDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshState {
    Normal,
    Static,
}

pub struct RefreshAgent {
    signal: Arc<Mutex<RefreshSignal>>,
    state: RefreshState,
    /// Panel rates learned at startup; None disables the agent.
    native_hz: Option<u32>,
    lowest_hz: Option<u32>,
}

impl RefreshAgent {
    pub fn new(
        signal: Arc<Mutex<RefreshSignal>>,
        native_hz: Option<u32>,
        lowest_hz: Option<u32>,
    ) -> Self {
        Self {
            signal,
            state: RefreshState::Normal,
            native_hz,
            lowest_hz,
        }
    }
}

impl Agent for RefreshAgent {
    fn name(&self) -> &'static str {
        "refresh"
    }

    fn propose(&mut self, ctx: &AgentContext<'_>) -> Proposal {
        let mut proposal = Proposal::empty(self.name());
        let (native, lowest) = match (self.native_hz, self.lowest_hz) {
            (Some(n), Some(l)) if n != l => (n, l),
            // Single-rate panel or no rate control: nothing to adapt.
            _ => return proposal,
        };
        if ctx.control_overridden(ControlTarget::RefreshRateHz) {
            return proposal;
        }

        let signal = *self.signal.lock().unwrap_or_else(|e| e.into_inner());

        match self.state {
            RefreshState::Normal => {
                if signal.static_for >= STATIC_HOLD {
                    self.state = RefreshState::Static;
                    debug!(
                        "Refresh: static for {:?}, collapsing {} -> {} Hz",
                        signal.static_for, native, lowest
                    );
                    proposal.actions.push(Action::new(
                        ControlTarget::RefreshRateHz,
                        ActionValue::RefreshHz(lowest),
                        Priority::Normal,
                        self.name(),
                        format!("screen static for {:?}", signal.static_for),
                    ));
                }
            }
            RefreshState::Static => {
                let motion = signal
                    .last_similarity
                    .map(|s| s < STATIC_SIMILARITY)
                    .unwrap_or(false);
                if motion {
                    self.state = RefreshState::Normal;
                    proposal.actions.push(Action::new(
                        ControlTarget::RefreshRateHz,
                        ActionValue::RefreshHz(native),
                        Priority::Normal,
                        self.name(),
                        "motion detected, restoring native rate",
                    ));
                }
            }
        }
        proposal
    }
}
