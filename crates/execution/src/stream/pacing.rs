//! Spacing between connect attempts across all sessions.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};
use tracing::warn;

#[derive(Debug)]
struct PacerState {
    next_slot: Option<Instant>,
    widened_until: Option<Instant>,
    factor: u32,
}

/// Hands out connect slots at least `spacing` apart.
#[derive(Debug)]
pub(crate) struct Pacer {
    spacing: Duration,
    state: Mutex<PacerState>,
}

impl Pacer {
    pub(crate) fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            state: Mutex::new(PacerState {
                next_slot: None,
                widened_until: None,
                factor: 1,
            }),
        }
    }

    /// Waits for the next free slot.
    pub(crate) async fn acquire(&self) {
        let slot = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let spacing = Self::spacing_at(self.spacing, &state, now);
            let slot = state.next_slot.map_or(now, |next| next.max(now));
            state.next_slot = Some(slot + spacing);
            slot
        };
        sleep_until(slot).await;
    }

    /// Multiplies the spacing by `factor` for `duration`.
    pub(crate) async fn widen(&self, factor: u32, duration: Duration) {
        let mut state = self.state.lock().await;
        let until = Instant::now() + duration;
        state.factor = factor.max(1);
        state.widened_until = Some(state.widened_until.map_or(until, |u| u.max(until)));
        warn!(
            factor = state.factor,
            widen_secs = duration.as_secs(),
            "Resubscribe pacing widened"
        );
    }

    /// Spacing in effect right now.
    pub(crate) async fn current_spacing(&self) -> Duration {
        let state = self.state.lock().await;
        Self::spacing_at(self.spacing, &state, Instant::now())
    }

    fn spacing_at(base: Duration, state: &PacerState, now: Instant) -> Duration {
        match state.widened_until {
            Some(until) if until > now => base.saturating_mul(state.factor),
            _ => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_slots_are_spaced_and_widening_expires() {
        let pacer = Pacer::new(Duration::from_millis(250));
        let start = Instant::now();
        pacer.acquire().await;
        pacer.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_millis(250));

        pacer.widen(4, Duration::from_secs(600)).await;
        assert_eq!(pacer.current_spacing().await, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(601)).await;
        assert_eq!(pacer.current_spacing().await, Duration::from_millis(250));
    }
}
