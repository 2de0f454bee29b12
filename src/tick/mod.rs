//! Master tick service
//!
//! One coalesced clock for every periodic consumer. A single timer task
//! produces `FastTick` every 500 ms and derives the slower grades from it:
//! `MediumTick` every 2nd, `SlowTick` every 6th, `VerySlowTick` every
//! 20th. Ticks fan out over a broadcast channel, so each subscriber runs
//! on its own task and a slow subscriber can never delay the next tick;
//! it merely lags and skips.

use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Base cadence of the clock.
pub const FAST_TICK_PERIOD: Duration = Duration::from_millis(500);
/// Fast-tick multiples for the derived grades.
pub const MEDIUM_EVERY: u64 = 2;
pub const SLOW_EVERY: u64 = 6;
pub const VERY_SLOW_EVERY: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    Fast,
    Medium,
    Slow,
    VerySlow,
}

#[derive(Debug, Clone, Copy)]
pub struct Tick {
    pub kind: TickKind,
    /// Fast-tick counter at emission time.
    pub seq: u64,
}

pub struct MasterTickService {
    tx: broadcast::Sender<Tick>,
    handle: tokio::task::JoinHandle<()>,
}

impl MasterTickService {
    /// Start the clock. It stops when `token` is cancelled.
    pub fn start(token: CancellationToken) -> Self {
        Self::start_with_period(token, FAST_TICK_PERIOD)
    }

    pub fn start_with_period(token: CancellationToken, period: Duration) -> Self {
        let (tx, _) = broadcast::channel(256);
        let clock_tx = tx.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut seq: u64 = 0;
            info!("Tick: master clock started, period {:?}", period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Tick: master clock stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        seq += 1;
                        // Send errors just mean nobody is listening yet.
                        let _ = clock_tx.send(Tick { kind: TickKind::Fast, seq });
                        if seq % MEDIUM_EVERY == 0 {
                            let _ = clock_tx.send(Tick { kind: TickKind::Medium, seq });
                        }
                        if seq % SLOW_EVERY == 0 {
                            let _ = clock_tx.send(Tick { kind: TickKind::Slow, seq });
                        }
                        if seq % VERY_SLOW_EVERY == 0 {
                            let _ = clock_tx.send(Tick { kind: TickKind::VerySlow, seq });
                        }
                    }
                }
            }
        });
        Self { tx, handle }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Tick> {
        self.tx.subscribe()
    }

    pub async fn shutdown(self) {
        // The clock task exits via the cancellation token; just reap it.
        let _ = self.handle.await;
    }
}

/// Wait for the next tick of one grade, skipping the others. Lagged
/// receivers resynchronize silently. Returns None when the clock is gone.
pub async fn next_tick(rx: &mut broadcast::Receiver<Tick>, kind: TickKind) -> Option<Tick> {
    loop {
        match rx.recv().await {
            Ok(tick) if tick.kind == kind => return Some(tick),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Tick: subscriber lagged, skipped {} ticks", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grades_fire_at_their_multiples() {
        let token = CancellationToken::new();
        let service = MasterTickService::start_with_period(token.clone(), Duration::from_millis(5));
        let mut rx = service.subscribe();

        let mut fast = 0u32;
        let mut medium = 0u32;
        let mut slow = 0u32;
        // Collect ticks until the 12th fast tick has fired.
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Ok(tick)) => {
                    match tick.kind {
                        TickKind::Fast => fast += 1,
                        TickKind::Medium => medium += 1,
                        TickKind::Slow => slow += 1,
                        TickKind::VerySlow => {}
                    }
                    if tick.kind == TickKind::Fast && tick.seq >= 12 {
                        break;
                    }
                }
                other => panic!("tick stream stalled: {:?}", other),
            }
        }
        assert!(fast >= 12);
        assert!((5..=7).contains(&medium), "medium fired {} times", medium);
        assert!((1..=3).contains(&slow), "slow fired {} times", slow);

        token.cancel();
        service.shutdown().await;
    }

    #[tokio::test]
    async fn next_tick_filters_kinds() {
        let token = CancellationToken::new();
        let service = MasterTickService::start_with_period(token.clone(), Duration::from_millis(2));
        let mut rx = service.subscribe();

        let tick = tokio::time::timeout(Duration::from_secs(2), next_tick(&mut rx, TickKind::Slow))
            .await
            .expect("slow tick within deadline")
            .expect("clock alive");
        assert_eq!(tick.kind, TickKind::Slow);
        assert_eq!(tick.seq % SLOW_EVERY, 0);

        token.cancel();
        service.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_ends_the_stream() {
        let token = CancellationToken::new();
        let service = MasterTickService::start_with_period(token.clone(), Duration::from_millis(2));
        let mut rx = service.subscribe();
        token.cancel();
        service.shutdown().await;
        // Drain whatever was in flight; the stream must terminate.
        let end = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match rx.recv().await {
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
        .await;
        assert!(end.is_ok(), "stream did not close after cancellation");
    }
}
