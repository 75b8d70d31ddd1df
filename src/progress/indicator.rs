//! Progress indicator interface and a ready-made in-memory implementation.
//!
//! The monitor only ever pushes a completion ratio in `[0, 1]` into an
//! indicator; what that looks like on screen is the host's business. The
//! bundled [`ProgressGauge`] mirrors the classic loading-bar behavior: a
//! non-zero ratio shows the bar, zero hides it.

use std::sync::{Arc, Mutex};

/// A sink for batch completion ratios.
///
/// Called on the driver thread only, once per tick per batch.
pub trait ProgressIndicator: Send + Sync {
    /// Pushes the current completion ratio. Implementations should clamp the
    /// value to `[0, 1]`.
    fn set_progress(&self, progress: f32);

    /// Makes the indicator visible.
    fn show(&self);

    /// Hides the indicator.
    fn hide(&self);
}

struct GaugeState {
    progress: f32,
    visible: bool,
}

/// An in-memory progress indicator.
///
/// Useful as the model behind a UI widget, in the demo binary, and in tests.
/// Visibility follows the value pushed by the monitor: a ratio above zero
/// shows the gauge, zero hides it. `show()`/`hide()` override that until the
/// next `set_progress` call.
pub struct ProgressGauge {
    state: Mutex<GaugeState>,
}

impl ProgressGauge {
    /// Creates a hidden gauge at zero progress.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GaugeState {
                progress: 0.0,
                visible: false,
            }),
        })
    }

    /// The last ratio pushed, clamped to `[0, 1]`.
    pub fn progress(&self) -> f32 {
        self.state.lock().unwrap().progress
    }

    /// Whether the gauge is currently visible.
    pub fn is_visible(&self) -> bool {
        self.state.lock().unwrap().visible
    }
}

impl ProgressIndicator for ProgressGauge {
    fn set_progress(&self, progress: f32) {
        let clamped = progress.clamp(0.0, 1.0);
        let mut state = self.state.lock().unwrap();
        state.progress = clamped;
        state.visible = clamped > 0.0;
    }

    fn show(&self) {
        self.state.lock().unwrap().visible = true;
    }

    fn hide(&self) {
        self.state.lock().unwrap().visible = false;
    }
}
