//! Racing coordinator.
//!
//! One attempt per upstream runs concurrently; the first success wins. Every
//! attempt reports into a channel sized to the number of participants so no
//! attempt ever blocks on reporting, and once the caller has its answer a
//! drain task keeps receiving so late successes are dropped (closed) instead
//! of leaking. All tasks run on the shared [`TaskTracker`], which lets
//! shutdown wait for true quiescence.

use crate::http::{self, HttpError, HttpRequest, HttpResponse};
use crate::socks::TargetAddress;
use crate::upstream::{DialError, Upstream, UpstreamDialer};
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Default overall deadline of one race
pub const DEFAULT_RACE_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure of a single race participant
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("write request: {0}")]
    Write(#[source] io::Error),

    #[error("read response: {0}")]
    Response(#[from] HttpError),

    #[error("cancelled")]
    Cancelled,
}

impl AttemptError {
    pub fn reply_code(&self) -> Option<u8> {
        match self {
            AttemptError::Dial(e) => e.reply_code(),
            _ => None,
        }
    }

    /// The attempt was cut short by the race deadline
    pub fn is_deadline(&self) -> bool {
        matches!(self, AttemptError::Dial(DialError::Deadline { .. }))
    }
}

#[derive(Debug)]
pub struct AttemptFailure {
    pub upstream: Upstream,
    pub elapsed: Duration,
    pub error: AttemptError,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {}ms: {}",
            self.upstream,
            self.elapsed.as_millis(),
            self.error
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RaceError {
    #[error("no upstreams to race")]
    NoParticipants,

    /// Every participant reported a failure before the deadline
    #[error("all upstreams failed: {}", join_failures(.0))]
    AllFailed(Vec<AttemptFailure>),

    /// The deadline passed before a success or before every participant reported
    #[error("race timed out after {0:?}")]
    Timeout(Duration),

    #[error("race cancelled")]
    Cancelled,
}

impl RaceError {
    /// Per-upstream failures; empty unless every participant failed
    pub fn failures(&self) -> &[AttemptFailure] {
        match self {
            RaceError::AllFailed(failures) => failures,
            _ => &[],
        }
    }
}

fn join_failures(failures: &[AttemptFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Latency of one participant as observed by the coordinator
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub upstream: Upstream,
    pub elapsed: Duration,
    pub succeeded: bool,
}

#[derive(Debug)]
pub struct RaceOutcome<T> {
    pub winner: Upstream,
    pub payload: T,
    /// Time from race start until the winner reported
    pub elapsed: Duration,
    /// Participants that reported before the winner was picked, winner last
    pub reports: Vec<AttemptReport>,
}

struct Attempt<T> {
    upstream: Upstream,
    elapsed: Duration,
    result: Result<T, AttemptError>,
}

/// Run `work` against every participant and return the first success.
///
/// Results are taken strictly in arrival order. Failures never escape the
/// race as errors of their own; they are collected into
/// [`RaceError::AllFailed`]. Payloads of losing participants are dropped,
/// which closes whatever socket they own.
pub async fn race<T, F, Fut>(
    participants: &[Upstream],
    race_timeout: Duration,
    tracker: &TaskTracker,
    cancel: &CancellationToken,
    work: F,
) -> Result<RaceOutcome<T>, RaceError>
where
    T: Send + 'static,
    F: Fn(Upstream, Instant) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>> + Send + 'static,
{
    if participants.is_empty() {
        return Err(RaceError::NoParticipants);
    }

    let started = Instant::now();
    let deadline = started + race_timeout;
    let total = participants.len();
    let (tx, mut rx) = mpsc::channel::<Attempt<T>>(total);
    let attempts_cancel = cancel.child_token();

    for upstream in participants {
        let attempt = work(upstream.clone(), deadline);
        let upstream = upstream.clone();
        let tx = tx.clone();
        let cancelled = attempts_cancel.clone();
        tracker.spawn(async move {
            let result = tokio::select! {
                result = attempt => result,
                _ = cancelled.cancelled() => Err(AttemptError::Cancelled),
            };
            // Capacity equals the participant count, so this never waits
            let _ = tx
                .send(Attempt {
                    upstream,
                    elapsed: started.elapsed(),
                    result,
                })
                .await;
        });
    }
    drop(tx);

    let mut failures = Vec::new();
    let mut reports = Vec::new();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                attempts_cancel.cancel();
                spawn_drain(tracker, rx);
                return Err(RaceError::Cancelled);
            }
            next = timeout_at(deadline, rx.recv()) => next,
        };

        let attempt = match next {
            Ok(Some(attempt)) => attempt,
            // Every sender is gone: all participants have reported
            Ok(None) => break,
            Err(_) => {
                attempts_cancel.cancel();
                spawn_drain(tracker, rx);
                debug!(
                    "race timed out after {:?} with {}/{} reports",
                    race_timeout,
                    reports.len(),
                    total
                );
                return Err(RaceError::Timeout(race_timeout));
            }
        };

        reports.push(AttemptReport {
            upstream: attempt.upstream.clone(),
            elapsed: attempt.elapsed,
            succeeded: attempt.result.is_ok(),
        });

        match attempt.result {
            Ok(payload) => {
                info!(
                    "winner: {} ({}ms) - received {}/{} responses",
                    attempt.upstream,
                    attempt.elapsed.as_millis(),
                    reports.len(),
                    total
                );
                // Losers have no further use
                attempts_cancel.cancel();
                spawn_drain(tracker, rx);
                return Ok(RaceOutcome {
                    winner: attempt.upstream,
                    payload,
                    elapsed: attempt.elapsed,
                    reports,
                });
            }
            Err(error) => {
                debug!(
                    "failed: {} ({}ms) - {}",
                    attempt.upstream,
                    attempt.elapsed.as_millis(),
                    error
                );
                failures.push(AttemptFailure {
                    upstream: attempt.upstream,
                    elapsed: attempt.elapsed,
                    error,
                });
            }
        }
    }

    // Attempts share the race deadline, so their own deadline errors can
    // arrive before the coordinator's timer fires
    if Instant::now() >= deadline || failures.iter().any(|f| f.error.is_deadline()) {
        debug!(
            "race timed out after {:?}: {}/{} attempts ran out of time",
            race_timeout,
            failures.iter().filter(|f| f.error.is_deadline()).count(),
            total
        );
        return Err(RaceError::Timeout(race_timeout));
    }

    Err(RaceError::AllFailed(failures))
}

/// Receive the remaining reports so every late success is closed
fn spawn_drain<T: Send + 'static>(tracker: &TaskTracker, mut rx: mpsc::Receiver<Attempt<T>>) {
    tracker.spawn(async move {
        while let Some(attempt) = rx.recv().await {
            if attempt.result.is_ok() {
                debug!(
                    "closed: {} ({}ms) - slower than winner",
                    attempt.upstream,
                    attempt.elapsed.as_millis()
                );
            }
        }
    });
}

/// Races one listener's upstreams, either for a tunnel or for one HTTP exchange
#[derive(Debug, Clone)]
pub struct Racer {
    upstreams: Arc<[Upstream]>,
    race_timeout: Duration,
    dialer: UpstreamDialer,
    tracker: TaskTracker,
}

impl Racer {
    pub fn new(
        upstreams: Vec<Upstream>,
        race_timeout: Duration,
        dialer: UpstreamDialer,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            upstreams: upstreams.into(),
            race_timeout,
            dialer,
            tracker,
        }
    }

    pub fn upstreams(&self) -> &[Upstream] {
        &self.upstreams
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// TCP-level race: the winner is a live tunnel to `target`
    pub async fn race_tunnel(
        &self,
        target: &TargetAddress,
        cancel: &CancellationToken,
    ) -> Result<RaceOutcome<TcpStream>, RaceError> {
        debug!("racing {} upstreams for {}", self.upstreams.len(), target);

        let target = Arc::new(target.clone());
        let dialer = self.dialer;
        let outcome = race(
            &self.upstreams,
            self.race_timeout,
            &self.tracker,
            cancel,
            |upstream, deadline| {
                let target = Arc::clone(&target);
                async move {
                    dialer
                        .dial(&upstream, &target, deadline)
                        .await
                        .map_err(AttemptError::from)
                }
            },
        )
        .await?;

        info!(
            "race completed for {}: winner={}, duration={}ms",
            target,
            outcome.winner,
            outcome.elapsed.as_millis()
        );
        Ok(outcome)
    }

    /// HTTP-level race: every upstream gets its own tunnel carrying the
    /// request's raw bytes; the first complete response wins. Tunnels are
    /// closed as soon as their response has been read.
    pub async fn race_request(
        &self,
        target: &TargetAddress,
        request: &HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<RaceOutcome<HttpResponse>, RaceError> {
        let target = Arc::new(target.clone());
        let raw = request.raw.clone();
        let method: Arc<str> = Arc::from(request.method.as_str());
        let dialer = self.dialer;

        race(
            &self.upstreams,
            self.race_timeout,
            &self.tracker,
            cancel,
            |upstream, deadline| {
                let target = Arc::clone(&target);
                let raw = raw.clone();
                let method = Arc::clone(&method);
                async move {
                    let mut tunnel = dialer.dial(&upstream, &target, deadline).await?;
                    tunnel.write_all(&raw).await.map_err(AttemptError::Write)?;
                    let mut reader = BufReader::new(tunnel);
                    let response = http::read_response(&mut reader, &method).await?;
                    Ok(response)
                }
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{spawn_upstream, UpstreamBehavior};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    /// Stands in for a socket: counts how many times it was closed
    struct Probe {
        closed: Arc<AtomicUsize>,
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn upstreams(n: usize) -> Vec<Upstream> {
        (0..n).map(|i| Upstream::new(format!("10.0.0.{}:1080", i))).collect()
    }

    fn index_of(upstream: &Upstream) -> usize {
        upstream.address[7..upstream.address.len() - 5].parse().unwrap()
    }

    fn dial_failure(upstream: &Upstream) -> AttemptError {
        AttemptError::Dial(DialError::Dial {
            upstream: upstream.to_string(),
            source: io::ErrorKind::ConnectionRefused.into(),
        })
    }

    fn deadline_failure(upstream: &Upstream) -> AttemptError {
        AttemptError::Dial(DialError::Deadline {
            upstream: upstream.to_string(),
        })
    }

    async fn quiesce(tracker: TaskTracker) {
        tracker.close();
        tokio::time::timeout(Duration::from_secs(5), tracker.wait())
            .await
            .expect("race tasks must finish");
    }

    #[tokio::test]
    async fn earliest_success_wins_and_losers_close_once() {
        let tracker = TaskTracker::new();
        let created = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        // participant i finishes after delays[i] ms; odd ones fail
        let delays = [300u64, 50, 120, 10, 200];

        let outcome = {
            let created = created.clone();
            let closed = closed.clone();
            race(
                &upstreams(delays.len()),
                Duration::from_secs(5),
                &tracker,
                &CancellationToken::new(),
                move |upstream, _deadline| {
                    let created = created.clone();
                    let closed = closed.clone();
                    async move {
                        let i = index_of(&upstream);
                        tokio::time::sleep(Duration::from_millis(delays[i])).await;
                        if i % 2 == 1 {
                            return Err(dial_failure(&upstream));
                        }
                        created.fetch_add(1, Ordering::SeqCst);
                        Ok(Probe { closed })
                    }
                },
            )
            .await
            .unwrap()
        };

        assert_eq!(outcome.winner, Upstream::new("10.0.0.2:1080"));
        assert_eq!(outcome.reports.len(), 3);
        assert!(outcome.reports.last().unwrap().succeeded);

        drop(outcome);
        quiesce(tracker).await;
        assert_eq!(closed.load(Ordering::SeqCst), created.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn late_successes_are_closed_by_the_drain() {
        let tracker = TaskTracker::new();
        let closed = Arc::new(AtomicUsize::new(0));

        // On a single thread every attempt completes and reports before the
        // coordinator receives its first result
        let outcome = {
            let closed = closed.clone();
            race(
                &upstreams(3),
                Duration::from_secs(5),
                &tracker,
                &CancellationToken::new(),
                move |_, _| {
                    let closed = closed.clone();
                    async move { Ok(Probe { closed }) }
                },
            )
            .await
            .unwrap()
        };

        let winner_payload = outcome.payload;
        quiesce(tracker).await;
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        drop(winner_payload);
        assert_eq!(closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn all_failures_are_aggregated() {
        let tracker = TaskTracker::new();
        let err = race::<(), _, _>(
            &upstreams(4),
            Duration::from_secs(5),
            &tracker,
            &CancellationToken::new(),
            |upstream, _| async move { Err(dial_failure(&upstream)) },
        )
        .await
        .unwrap_err();

        match err {
            RaceError::AllFailed(failures) => {
                assert_eq!(failures.len(), 4);
                let mut seen: Vec<usize> = failures.iter().map(|f| index_of(&f.upstream)).collect();
                seen.sort_unstable();
                assert_eq!(seen, vec![0, 1, 2, 3]);
            }
            other => panic!("expected AllFailed, got {:?}", other),
        }
        quiesce(tracker).await;
    }

    #[tokio::test]
    async fn deadline_yields_timeout_and_closes_everything() {
        let tracker = TaskTracker::new();
        let created = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        let err = {
            let created = created.clone();
            let closed = closed.clone();
            race(
                &upstreams(3),
                Duration::from_millis(50),
                &tracker,
                &CancellationToken::new(),
                move |_, _| {
                    let created = created.clone();
                    let closed = closed.clone();
                    async move {
                        // Holds its "socket" while stuck
                        created.fetch_add(1, Ordering::SeqCst);
                        let _held = Probe { closed };
                        std::future::pending::<Result<(), AttemptError>>().await
                    }
                },
            )
            .await
            .unwrap_err()
        };

        assert!(matches!(err, RaceError::Timeout(d) if d == Duration::from_millis(50)));
        quiesce(tracker).await;
        assert_eq!(created.load(Ordering::SeqCst), 3);
        assert_eq!(closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failures_then_timeout_is_still_a_timeout() {
        let tracker = TaskTracker::new();
        let err = race::<(), _, _>(
            &upstreams(2),
            Duration::from_millis(50),
            &tracker,
            &CancellationToken::new(),
            |upstream, _| async move {
                if index_of(&upstream) == 0 {
                    return Err(dial_failure(&upstream));
                }
                std::future::pending().await
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RaceError::Timeout(_)));
        quiesce(tracker).await;
    }

    #[tokio::test]
    async fn deadline_failures_reported_before_the_timer_are_a_timeout() {
        let tracker = TaskTracker::new();
        let err = race::<(), _, _>(
            &upstreams(3),
            Duration::from_secs(5),
            &tracker,
            &CancellationToken::new(),
            |upstream, _| async move {
                if index_of(&upstream) == 0 {
                    return Err(dial_failure(&upstream));
                }
                Err(deadline_failure(&upstream))
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RaceError::Timeout(_)), "got {:?}", err);
        quiesce(tracker).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stalled_upstreams_always_time_out() {
        let stalled = vec![
            spawn_upstream(UpstreamBehavior::Stall).await,
            spawn_upstream(UpstreamBehavior::Stall).await,
            spawn_upstream(UpstreamBehavior::Stall).await,
        ];
        let target = TargetAddress::domain("example.com", 443).unwrap();

        for _ in 0..20 {
            let tracker = TaskTracker::new();
            let racer = Racer::new(
                stalled.clone(),
                Duration::from_millis(100),
                UpstreamDialer::default(),
                tracker.clone(),
            );
            let err = racer
                .race_tunnel(&target, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, RaceError::Timeout(_)), "got {:?}", err);
            quiesce(tracker).await;
        }
    }

    #[tokio::test]
    async fn outer_cancellation_stops_the_race() {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = race::<(), _, _>(
            &upstreams(2),
            Duration::from_secs(30),
            &tracker,
            &cancel,
            |_, _| std::future::pending(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RaceError::Cancelled));
        quiesce(tracker).await;
    }

    #[tokio::test]
    async fn empty_participant_list_is_rejected() {
        let err = race::<(), _, _>(
            &[],
            Duration::from_secs(1),
            &TaskTracker::new(),
            &CancellationToken::new(),
            |_, _| async { Ok(()) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RaceError::NoParticipants));
    }

    #[tokio::test]
    async fn tunnel_race_picks_the_responsive_upstream() {
        let dead = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            Upstream::named("dead", listener.local_addr().unwrap().to_string())
        };
        let slow = spawn_upstream(UpstreamBehavior::Stall).await;
        let live = spawn_upstream(UpstreamBehavior::Echo).await;

        let tracker = TaskTracker::new();
        let racer = Racer::new(
            vec![dead, slow, live.clone()],
            Duration::from_secs(2),
            UpstreamDialer::default(),
            tracker.clone(),
        );
        let target = TargetAddress::domain("example.com", 443).unwrap();

        let outcome = racer
            .race_tunnel(&target, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.winner, live);

        let mut tunnel = outcome.payload;
        tunnel.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        drop(tunnel);
        quiesce(tracker).await;
    }

    #[tokio::test]
    async fn request_race_returns_first_complete_response() {
        let fast = spawn_upstream(UpstreamBehavior::Http {
            delay: Duration::from_millis(10),
            response: b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 4\r\n\r\nfast",
        })
        .await;
        let slow = spawn_upstream(UpstreamBehavior::Http {
            delay: Duration::from_millis(300),
            response: b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nslow",
        })
        .await;

        let tracker = TaskTracker::new();
        let racer = Racer::new(
            vec![slow, fast.clone()],
            Duration::from_secs(2),
            UpstreamDialer::default(),
            tracker.clone(),
        );
        let target = TargetAddress::domain("example.com", 80).unwrap();
        let wire = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let request = http::read_request(&mut BufReader::new(&wire[..])).await.unwrap();

        let outcome = racer
            .race_request(&target, &request, &CancellationToken::new())
            .await
            .unwrap();

        // Status codes play no part in picking the winner
        assert_eq!(outcome.winner, fast);
        assert_eq!(outcome.payload.status_code, 502);
        assert_eq!(
            &outcome.payload.raw[..],
            b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 4\r\n\r\nfast"
        );
        quiesce(tracker).await;
    }

    #[tokio::test]
    async fn request_race_aggregates_upstream_refusals() {
        let a = spawn_upstream(UpstreamBehavior::Refuse(0x05)).await;
        let b = spawn_upstream(UpstreamBehavior::Refuse(0x04)).await;

        let racer = Racer::new(
            vec![a, b],
            Duration::from_secs(2),
            UpstreamDialer::default(),
            TaskTracker::new(),
        );
        let target = TargetAddress::domain("example.com", 80).unwrap();
        let wire = b"GET / HTTP/1.1\r\n\r\n";
        let request = http::read_request(&mut BufReader::new(&wire[..])).await.unwrap();

        let err = racer
            .race_request(&target, &request, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RaceError::AllFailed(_)), "got {:?}", err);
        let mut codes: Vec<_> = err.failures().iter().filter_map(|f| f.error.reply_code()).collect();
        codes.sort_unstable();
        assert_eq!(codes, vec![0x04, 0x05]);
        assert!(RaceError::Timeout(Duration::from_secs(1)).failures().is_empty());
    }
}
