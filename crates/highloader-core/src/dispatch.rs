//! Rate-controlled dispatch: one ticker, one detached attempt per tick.
//!
//! Attempts are never joined. With a slow target and a high rate they pile
//! up concurrently without bound; that is the load the tool exists to
//! produce, but it also means memory and sockets grow with
//! `rate * latency`.

use crate::cadence::Cadence;
use crate::engine::{CallContext, CallEngine};
use crate::error::{DispatchError, EngineError};
use crate::outcome::OutcomeAggregator;
use crate::params::CallParams;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `stop()` was called.
    Stopped,
    /// The parent token was cancelled.
    Cancelled,
    /// The configured total-run duration elapsed.
    DurationElapsed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    /// Attempts spawned by the loop; some may still be in flight.
    pub scheduled: u64,
    pub elapsed_ms: u64,
    pub reason: StopReason,
}

/// `Idle -> Running -> Stopped`. A loop runs once; build a new one to run
/// again.
pub struct DispatchLoop {
    state: AtomicU8,
    token: CancellationToken,
    duration_elapsed: Arc<AtomicBool>,
}

impl DispatchLoop {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            token: CancellationToken::new(),
            duration_elapsed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> LoopState {
        match self.state.load(Ordering::SeqCst) {
            IDLE => LoopState::Idle,
            RUNNING => LoopState::Running,
            _ => LoopState::Stopped,
        }
    }

    /// Request a stop. Safe to call any number of times, before, during or
    /// after `start`; the loop notices at its next tick boundary.
    pub fn stop(&self) {
        if !self.token.is_cancelled() {
            debug!("Stop requested");
        }
        self.token.cancel();
    }

    /// Run until stopped, the parent token is cancelled, or
    /// `params.stop_after` elapses. `aggregator` must be the engine's own and
    /// is reset first. Returns once no more attempts will be scheduled and
    /// the stop timer has exited; in-flight attempts keep running and keep
    /// recording outcomes.
    pub async fn start(
        &self,
        parent: &CancellationToken,
        engine: Arc<CallEngine>,
        params: &CallParams,
        aggregator: &Arc<OutcomeAggregator>,
    ) -> Result<DispatchSummary, DispatchError> {
        if params.rate == 0 {
            return Err(DispatchError::InvalidRate);
        }
        if !Arc::ptr_eq(engine.aggregator(), aggregator) {
            return Err(DispatchError::AggregatorMismatch);
        }
        self.state
            .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| DispatchError::AlreadyStarted)?;

        aggregator.reset();

        let stop_timer = params
            .stop_after
            .map(|stop_after| self.spawn_stop_timer(stop_after));

        let mut cadence = Cadence::new(params.rate);
        let template: Arc<str> = Arc::from(params.payload_template.as_str());
        let started = Instant::now();
        let mut scheduled = 0u64;

        info!(
            "Dispatching {} at {} calls/s (period {:?}, deadline {:?}, stop after {:?})",
            params.label(),
            params.rate,
            cadence.period(),
            params.deadline,
            params.stop_after
        );

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = parent.cancelled() => break,
                _ = cadence.tick() => {}
            }

            scheduled += 1;
            spawn_attempt(engine.clone(), template.clone(), params.deadline);
        }

        self.state.store(STOPPED, Ordering::SeqCst);
        self.token.cancel();
        if let Some(timer) = stop_timer {
            if let Err(e) = timer.await {
                warn!("Stop timer for {} failed: {}", params.label(), e);
            }
        }

        let reason = if parent.is_cancelled() {
            StopReason::Cancelled
        } else if self.duration_elapsed.load(Ordering::SeqCst) {
            StopReason::DurationElapsed
        } else {
            StopReason::Stopped
        };
        let summary = DispatchSummary {
            scheduled,
            elapsed_ms: started.elapsed().as_millis() as u64,
            reason,
        };
        info!(
            "Stopped {}: scheduled={} elapsed={}ms reason={:?}",
            params.label(),
            summary.scheduled,
            summary.elapsed_ms,
            summary.reason
        );
        Ok(summary)
    }

    fn spawn_stop_timer(&self, stop_after: Duration) -> JoinHandle<()> {
        let token = self.token.clone();
        let elapsed = self.duration_elapsed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(stop_after) => {
                    elapsed.store(true, Ordering::SeqCst);
                    token.cancel();
                }
            }
        })
    }
}

impl Default for DispatchLoop {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_attempt(engine: Arc<CallEngine>, template: Arc<str>, deadline: Option<Duration>) {
    tokio::spawn(async move {
        let ctx = CallContext::with_timeout(deadline);
        match engine.invoke(&ctx, &template).await {
            Ok(()) => {}
            Err(EngineError::CallOutcome { code, message }) => {
                debug!("Call returned {:?}: {}", code, message);
            }
            Err(err) => warn!("Error sending unary request: {}", err),
        }
    }
    .in_current_span());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{build_engine_with_transport, EngineOptions};
    use crate::outcome::Outcome;
    use crate::reflector::SchemaReflector;
    use crate::test_support::{write_proto, ECHO_PROTO};
    use crate::transport::MockTransport;

    struct Rig {
        _dir: tempfile::TempDir,
        params: CallParams,
        engine: Arc<CallEngine>,
        aggregator: Arc<OutcomeAggregator>,
        transport: Arc<MockTransport>,
    }

    fn rig(
        rate: u64,
        stop_after: Option<Duration>,
        template: &str,
        transport: MockTransport,
    ) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let path = write_proto(dir.path(), "echo.proto", ECHO_PROTO);
        let schema = Arc::new(SchemaReflector::new().resolve(&path).unwrap());
        let params = CallParams::new(schema, "localhost:50051", "Echo", "Say")
            .unwrap()
            .with_rate(rate)
            .with_stop_after(stop_after)
            .with_template(template);

        let transport = Arc::new(transport);
        let aggregator = Arc::new(OutcomeAggregator::new());
        let engine = build_engine_with_transport(
            &params,
            aggregator.clone(),
            &EngineOptions::default(),
            transport.clone(),
        )
        .unwrap();

        Rig {
            _dir: dir,
            params,
            engine: Arc::new(engine),
            aggregator,
            transport,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_end_to_end() {
        let rig = rig(
            10,
            Some(Duration::from_secs(1)),
            r#"{"text":"hi-{{randNum 1 3}}"}"#,
            MockTransport::new(Duration::from_millis(5)),
        );
        let dispatch = DispatchLoop::new();

        let summary = dispatch
            .start(
                &CancellationToken::new(),
                rig.engine.clone(),
                &rig.params,
                &rig.aggregator,
            )
            .await
            .unwrap();
        assert_eq!(summary.reason, StopReason::DurationElapsed);
        assert_eq!(dispatch.state(), LoopState::Stopped);

        // Let in-flight attempts finish.
        sleep(Duration::from_millis(100)).await;

        let snapshot = rig.aggregator.snapshot();
        assert!((8..=12).contains(&snapshot.total), "total: {}", snapshot.total);
        assert_eq!(snapshot.total, summary.scheduled);
        assert_eq!(snapshot.succeeded(), snapshot.total);
        assert_eq!(snapshot.failed(), 0);
        assert_eq!(rig.transport.calls(), snapshot.total);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_times_duration() {
        let rig = rig(
            200,
            Some(Duration::from_secs(2)),
            r#"{"text":"x"}"#,
            MockTransport::new(Duration::from_millis(20)),
        );

        let summary = DispatchLoop::new()
            .start(
                &CancellationToken::new(),
                rig.engine.clone(),
                &rig.params,
                &rig.aggregator,
            )
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        let total = rig.aggregator.total();
        assert!((360..=440).contains(&total), "total: {}", total);
        assert_eq!(total, summary.scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_template_counts_failures_without_stopping() {
        let rig = rig(
            10,
            Some(Duration::from_secs(1)),
            r#"{"text":"{{randNum}}"}"#,
            MockTransport::new(Duration::ZERO),
        );

        let summary = DispatchLoop::new()
            .start(
                &CancellationToken::new(),
                rig.engine.clone(),
                &rig.params,
                &rig.aggregator,
            )
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        let snapshot = rig.aggregator.snapshot();
        assert!(snapshot.total >= 8, "total: {}", snapshot.total);
        assert_eq!(snapshot.total, summary.scheduled);
        assert_eq!(snapshot.get(Outcome::BuildFailure), snapshot.total);
        assert_eq!(snapshot.succeeded(), 0);
        assert_eq!(rig.transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_scheduling_but_not_in_flight_attempts() {
        let rig = rig(
            10,
            None,
            r#"{"text":"slow"}"#,
            MockTransport::new(Duration::from_millis(300)),
        );
        let dispatch = Arc::new(DispatchLoop::new());

        let handle = {
            let dispatch = dispatch.clone();
            let engine = rig.engine.clone();
            let params = rig.params.clone();
            let aggregator = rig.aggregator.clone();
            tokio::spawn(async move {
                dispatch
                    .start(&CancellationToken::new(), engine, &params, &aggregator)
                    .await
            })
        };

        sleep(Duration::from_millis(550)).await;
        assert_eq!(dispatch.state(), LoopState::Running);
        dispatch.stop();
        dispatch.stop();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.reason, StopReason::Stopped);
        assert_eq!(summary.scheduled, 6);
        assert_eq!(dispatch.state(), LoopState::Stopped);

        // Attempts started at 400ms and 500ms are still waiting on the target.
        let at_stop = rig.aggregator.snapshot();
        assert_eq!(at_stop.total, 6);
        assert!(at_stop.completed() < 6, "completed: {}", at_stop.completed());

        sleep(Duration::from_secs(1)).await;
        let later = rig.aggregator.snapshot();
        assert_eq!(later.total, 6);
        assert_eq!(later.completed(), 6);
        assert_eq!(later.succeeded(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_stops_loop() {
        let rig = rig(50, None, "{}", MockTransport::new(Duration::ZERO));
        let parent = CancellationToken::new();

        let canceller = {
            let parent = parent.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(200)).await;
                parent.cancel();
            })
        };

        let summary = DispatchLoop::new()
            .start(&parent, rig.engine.clone(), &rig.params, &rig.aggregator)
            .await
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(summary.reason, StopReason::Cancelled);
        assert!((9..=11).contains(&summary.scheduled), "scheduled: {}", summary.scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_attempt_deadline() {
        let mut rig = rig(
            10,
            Some(Duration::from_millis(500)),
            "{}",
            MockTransport::new(Duration::from_secs(1)),
        );
        rig.params = rig.params.clone().with_deadline(Some(Duration::from_millis(50)));

        DispatchLoop::new()
            .start(
                &CancellationToken::new(),
                rig.engine.clone(),
                &rig.params,
                &rig.aggregator,
            )
            .await
            .unwrap();
        sleep(Duration::from_millis(200)).await;

        let snapshot = rig.aggregator.snapshot();
        assert!(snapshot.total > 0);
        assert_eq!(snapshot.get(Outcome::DeadlineExceeded), snapshot.total);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_resets_counters() {
        let rig = rig(10, None, "{}", MockTransport::new(Duration::ZERO));
        for _ in 0..5 {
            rig.aggregator.increment_total();
            rig.aggregator.increment_outcome(Outcome::Internal);
        }

        let dispatch = DispatchLoop::new();
        dispatch.stop();
        let summary = dispatch
            .start(
                &CancellationToken::new(),
                rig.engine.clone(),
                &rig.params,
                &rig.aggregator,
            )
            .await
            .unwrap();

        assert_eq!(summary.scheduled, 0);
        assert_eq!(summary.reason, StopReason::Stopped);
        let snapshot = rig.aggregator.snapshot();
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.get(Outcome::Internal), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejects_zero_rate_and_restart() {
        let rig = rig(10, Some(Duration::from_millis(100)), "{}", MockTransport::new(Duration::ZERO));
        let dispatch = DispatchLoop::new();
        let token = CancellationToken::new();

        let zero = rig.params.clone().with_rate(0);
        let err = dispatch
            .start(&token, rig.engine.clone(), &zero, &rig.aggregator)
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::InvalidRate);
        assert_eq!(dispatch.state(), LoopState::Idle);

        dispatch
            .start(&token, rig.engine.clone(), &rig.params, &rig.aggregator)
            .await
            .unwrap();
        let err = dispatch
            .start(&token, rig.engine.clone(), &rig.params, &rig.aggregator)
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::AlreadyStarted);
        assert_eq!(dispatch.state(), LoopState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancel_ends_stop_timer() {
        let rig = rig(
            10,
            Some(Duration::from_secs(3600)),
            "{}",
            MockTransport::new(Duration::ZERO),
        );
        let parent = CancellationToken::new();
        let dispatch = DispatchLoop::new();
        let test_start = Instant::now();

        let canceller = {
            let parent = parent.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(250)).await;
                parent.cancel();
            })
        };

        let summary = dispatch
            .start(&parent, rig.engine.clone(), &rig.params, &rig.aggregator)
            .await
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(summary.reason, StopReason::Cancelled);
        assert!(dispatch.token.is_cancelled());
        // The timer was joined without sleeping out its hour.
        assert!(test_start.elapsed() < Duration::from_secs(1), "{:?}", test_start.elapsed());
    }

    #[tokio::test]
    async fn test_start_rejects_foreign_aggregator() {
        let rig = rig(10, None, "{}", MockTransport::new(Duration::ZERO));
        let foreign = Arc::new(OutcomeAggregator::new());
        foreign.increment_total();
        let dispatch = DispatchLoop::new();

        let err = dispatch
            .start(&CancellationToken::new(), rig.engine.clone(), &rig.params, &foreign)
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::AggregatorMismatch);
        assert_eq!(dispatch.state(), LoopState::Idle);
        assert_eq!(foreign.total(), 1);
    }
}
