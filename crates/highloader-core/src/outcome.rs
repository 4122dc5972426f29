use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Classification of a completed attempt: the gRPC status code it ended
/// with, or `BuildFailure` when no request could be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
    BuildFailure,
}

const OUTCOME_COUNT: usize = 18;

impl Outcome {
    pub const ALL: [Outcome; OUTCOME_COUNT] = [
        Outcome::Ok,
        Outcome::Cancelled,
        Outcome::Unknown,
        Outcome::InvalidArgument,
        Outcome::DeadlineExceeded,
        Outcome::NotFound,
        Outcome::AlreadyExists,
        Outcome::PermissionDenied,
        Outcome::ResourceExhausted,
        Outcome::FailedPrecondition,
        Outcome::Aborted,
        Outcome::OutOfRange,
        Outcome::Unimplemented,
        Outcome::Internal,
        Outcome::Unavailable,
        Outcome::DataLoss,
        Outcome::Unauthenticated,
        Outcome::BuildFailure,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn is_success(self) -> bool {
        self == Outcome::Ok
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Ok => "OK",
            Outcome::Cancelled => "Cancelled",
            Outcome::Unknown => "Unknown",
            Outcome::InvalidArgument => "InvalidArgument",
            Outcome::DeadlineExceeded => "DeadlineExceeded",
            Outcome::NotFound => "NotFound",
            Outcome::AlreadyExists => "AlreadyExists",
            Outcome::PermissionDenied => "PermissionDenied",
            Outcome::ResourceExhausted => "ResourceExhausted",
            Outcome::FailedPrecondition => "FailedPrecondition",
            Outcome::Aborted => "Aborted",
            Outcome::OutOfRange => "OutOfRange",
            Outcome::Unimplemented => "Unimplemented",
            Outcome::Internal => "Internal",
            Outcome::Unavailable => "Unavailable",
            Outcome::DataLoss => "DataLoss",
            Outcome::Unauthenticated => "Unauthenticated",
            Outcome::BuildFailure => "BuildFailure",
        }
    }
}

impl From<tonic::Code> for Outcome {
    fn from(code: tonic::Code) -> Self {
        match code {
            tonic::Code::Ok => Outcome::Ok,
            tonic::Code::Cancelled => Outcome::Cancelled,
            tonic::Code::Unknown => Outcome::Unknown,
            tonic::Code::InvalidArgument => Outcome::InvalidArgument,
            tonic::Code::DeadlineExceeded => Outcome::DeadlineExceeded,
            tonic::Code::NotFound => Outcome::NotFound,
            tonic::Code::AlreadyExists => Outcome::AlreadyExists,
            tonic::Code::PermissionDenied => Outcome::PermissionDenied,
            tonic::Code::ResourceExhausted => Outcome::ResourceExhausted,
            tonic::Code::FailedPrecondition => Outcome::FailedPrecondition,
            tonic::Code::Aborted => Outcome::Aborted,
            tonic::Code::OutOfRange => Outcome::OutOfRange,
            tonic::Code::Unimplemented => Outcome::Unimplemented,
            tonic::Code::Internal => Outcome::Internal,
            tonic::Code::Unavailable => Outcome::Unavailable,
            tonic::Code::DataLoss => Outcome::DataLoss,
            tonic::Code::Unauthenticated => Outcome::Unauthenticated,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-outcome counters shared by every attempt of one call configuration.
///
/// Each counter is an independent atomic, so increments never contend on a
/// lock. A snapshot reads the counters one after another: every value is
/// exact, but under concurrent writes the set is not a single point in time
/// and `total` may run ahead of the sum of outcomes while attempts are in
/// flight.
pub struct OutcomeAggregator {
    total: AtomicU64,
    outcomes: [AtomicU64; OUTCOME_COUNT],
    epoch: Instant,
    reset_at_micros: AtomicU64,
}

impl OutcomeAggregator {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            outcomes: std::array::from_fn(|_| AtomicU64::new(0)),
            epoch: Instant::now(),
            reset_at_micros: AtomicU64::new(0),
        }
    }

    pub fn increment_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_outcome(&self, outcome: Outcome) {
        self.outcomes[outcome.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn count(&self, outcome: Outcome) -> u64 {
        self.outcomes[outcome.index()].load(Ordering::Relaxed)
    }

    /// Zero every counter and restart the elapsed clock.
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        for counter in &self.outcomes {
            counter.store(0, Ordering::Relaxed);
        }
        let now = self.epoch.elapsed().as_micros() as u64;
        self.reset_at_micros.store(now, Ordering::Relaxed);
    }

    pub fn elapsed_ms(&self) -> u64 {
        let now = self.epoch.elapsed().as_micros() as u64;
        now.saturating_sub(self.reset_at_micros.load(Ordering::Relaxed)) / 1000
    }

    pub fn snapshot(&self) -> OutcomeSnapshot {
        let outcomes = Outcome::ALL
            .iter()
            .map(|&outcome| (outcome, self.count(outcome)))
            .collect();
        OutcomeSnapshot {
            total: self.total(),
            outcomes,
            elapsed_ms: self.elapsed_ms(),
        }
    }
}

impl Default for OutcomeAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSnapshot {
    pub total: u64,
    pub outcomes: BTreeMap<Outcome, u64>,
    pub elapsed_ms: u64,
}

impl OutcomeSnapshot {
    pub fn get(&self, outcome: Outcome) -> u64 {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    /// Attempts that have recorded an outcome.
    pub fn completed(&self) -> u64 {
        self.outcomes.values().sum()
    }

    pub fn succeeded(&self) -> u64 {
        self.get(Outcome::Ok)
    }

    pub fn failed(&self) -> u64 {
        self.completed().saturating_sub(self.succeeded())
    }

    /// Attempts per second since the last reset.
    pub fn achieved_rate(&self) -> u64 {
        if self.elapsed_ms == 0 {
            return 0;
        }
        (self.total * 1000) / self.elapsed_ms
    }

    /// Non-zero outcomes only, for compact progress lines.
    pub fn non_zero(&self) -> impl Iterator<Item = (Outcome, u64)> + '_ {
        self.outcomes
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(&outcome, &count)| (outcome, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_snapshot_after_reset_is_zero() {
        let aggregator = OutcomeAggregator::new();
        aggregator.increment_total();
        aggregator.increment_outcome(Outcome::Ok);
        aggregator.increment_outcome(Outcome::Unavailable);

        aggregator.reset();
        let snapshot = aggregator.snapshot();

        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.outcomes.len(), Outcome::ALL.len());
        assert!(snapshot.outcomes.values().all(|&v| v == 0));
    }

    #[test]
    fn test_counts_per_category() {
        let aggregator = OutcomeAggregator::new();
        for outcome in [Outcome::Ok, Outcome::Ok, Outcome::NotFound, Outcome::BuildFailure] {
            aggregator.increment_total();
            aggregator.increment_outcome(outcome);
        }

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.total, 4);
        assert_eq!(snapshot.succeeded(), 2);
        assert_eq!(snapshot.get(Outcome::NotFound), 1);
        assert_eq!(snapshot.get(Outcome::BuildFailure), 1);
        assert_eq!(snapshot.failed(), 2);
        assert_eq!(
            snapshot.non_zero().collect::<Vec<_>>(),
            vec![
                (Outcome::Ok, 2),
                (Outcome::NotFound, 1),
                (Outcome::BuildFailure, 1)
            ]
        );
    }

    #[test]
    fn test_concurrent_increments_are_exact() {
        let aggregator = Arc::new(OutcomeAggregator::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let aggregator = aggregator.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        aggregator.increment_total();
                        let outcome = Outcome::ALL[(t + i) % Outcome::ALL.len()];
                        aggregator.increment_outcome(outcome);
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.total, 8000);
        assert_eq!(snapshot.completed(), 8000);
    }

    #[test]
    fn test_outcome_from_code() {
        assert_eq!(Outcome::from(tonic::Code::Ok), Outcome::Ok);
        assert_eq!(
            Outcome::from(tonic::Code::DeadlineExceeded),
            Outcome::DeadlineExceeded
        );
        assert_eq!(
            Outcome::from(tonic::Code::Unauthenticated),
            Outcome::Unauthenticated
        );
        for (idx, outcome) in Outcome::ALL.iter().enumerate() {
            assert_eq!(outcome.index(), idx);
        }
    }

    #[test]
    fn test_snapshot_serializes_category_names() {
        let aggregator = OutcomeAggregator::new();
        aggregator.increment_total();
        aggregator.increment_outcome(Outcome::ResourceExhausted);

        let json = serde_json::to_value(aggregator.snapshot()).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["outcomes"]["resource_exhausted"], 1);
        assert_eq!(json["outcomes"]["ok"], 0);
    }
}
