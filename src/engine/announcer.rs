use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::tracker::{Announce, Event, Tracker, Transfer};

/// The announcer pulls a fresh transfer snapshot from the engine right
/// before each announce.
pub(crate) struct AnnouncerRequest {
    pub respond_to: oneshot::Sender<Transfer>,
}

/// How long a final `Stopped` announce may hold up shutdown.
const STOP_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry schedule for failing trackers: 5 s doubling to 30 min, with
/// ±50% jitter, retrying forever.
pub(crate) struct Backoff {
    current: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_secs(5);
    const MAX: Duration = Duration::from_secs(30 * 60);
    const MULTIPLIER: f64 = 2.0;
    const RANDOMIZATION: f64 = 0.5;

    pub fn new() -> Self {
        Self {
            current: Self::INITIAL,
        }
    }

    pub fn reset(&mut self) {
        self.current = Self::INITIAL;
    }

    pub fn next(&mut self) -> Duration {
        let interval = self.current;
        self.current = interval.mul_f64(Self::MULTIPLIER).min(Self::MAX);

        let delta = interval.mul_f64(Self::RANDOMIZATION);
        let low = interval - delta;
        low + delta.mul_f64(rand::rng().random_range(0.0..=2.0))
    }
}

enum AnnounceError {
    /// The engine is gone; the announcer exits quietly.
    EngineGone,
    Tracker(crate::tracker::TrackerError),
}

/// One announcer loop per tracker URL.
///
/// Announces `Started` once, re-announces on the tracker's interval,
/// announces `Completed` on the first completion transition and
/// `Stopped` on shutdown. Tracker errors retry with [`Backoff`];
/// returned peers block on the engine's address channel until accepted.
pub(crate) async fn run_announcer(
    tracker: Box<dyn Tracker>,
    requests: mpsc::Sender<AnnouncerRequest>,
    addrs: mpsc::Sender<Vec<SocketAddr>>,
    mut completed: watch::Receiver<bool>,
    mut stop: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new();
    let mut next = Duration::ZERO;
    let mut started = false;
    let mut completed_seen = *completed.borrow_and_update();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(next) => {
                let event = if started { Event::None } else { Event::Started };
                match announce(tracker.as_ref(), &requests, event).await {
                    Ok(response) => {
                        started = true;
                        backoff.reset();
                        next = response.interval;
                        if !response.peers.is_empty()
                            && addrs.send(response.peers).await.is_err()
                        {
                            return;
                        }
                    }
                    Err(AnnounceError::EngineGone) => return,
                    Err(AnnounceError::Tracker(err)) => {
                        // Started counts as sent even when the announce
                        // failed; retries go out as plain announces.
                        started = true;
                        next = backoff.next();
                        warn!("announce to {} failed: {err}", tracker.url());
                    }
                }
            }
            changed = completed.changed(), if !completed_seen => {
                if changed.is_err() {
                    return;
                }
                if *completed.borrow_and_update() {
                    completed_seen = true;
                    if let Err(AnnounceError::EngineGone) =
                        announce(tracker.as_ref(), &requests, Event::Completed).await
                    {
                        return;
                    }
                }
            }
            _ = stop.changed() => {
                debug!("announcing stopped to {}", tracker.url());
                let _ = timeout(
                    STOP_ANNOUNCE_TIMEOUT,
                    announce(tracker.as_ref(), &requests, Event::Stopped),
                )
                .await;
                return;
            }
        }
    }
}

async fn announce(
    tracker: &dyn Tracker,
    requests: &mpsc::Sender<AnnouncerRequest>,
    event: Event,
) -> Result<Announce, AnnounceError> {
    let (tx, rx) = oneshot::channel();
    requests
        .send(AnnouncerRequest { respond_to: tx })
        .await
        .map_err(|_| AnnounceError::EngineGone)?;
    let transfer = rx.await.map_err(|_| AnnounceError::EngineGone)?;
    tracker
        .announce(&transfer, event)
        .await
        .map_err(AnnounceError::Tracker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::InfoHash;
    use crate::peer::PeerId;
    use crate::tracker::TrackerError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[test]
    fn backoff_envelope() {
        let mut backoff = Backoff::new();
        let mut base = Duration::from_secs(5);
        for _ in 0..16 {
            let delay = backoff.next();
            assert!(delay >= base.mul_f64(0.5), "{delay:?} below {base:?} envelope");
            assert!(delay <= base.mul_f64(1.5), "{delay:?} above {base:?} envelope");
            base = base.mul_f64(2.0).min(Duration::from_secs(30 * 60));
        }
        // Capped at 30 minutes (plus jitter).
        assert!(backoff.next() <= Duration::from_secs(45 * 60));

        backoff.reset();
        assert!(backoff.next() <= Duration::from_secs(8));
    }

    struct FlakyTracker {
        failures: Mutex<u32>,
        events: Mutex<Vec<(Event, tokio::time::Instant)>>,
    }

    #[async_trait]
    impl Tracker for FlakyTracker {
        async fn announce(
            &self,
            _transfer: &Transfer,
            event: Event,
        ) -> Result<Announce, TrackerError> {
            self.events
                .lock()
                .unwrap()
                .push((event, tokio::time::Instant::now()));
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(TrackerError::InvalidResponse("flaky"));
            }
            Ok(Announce {
                interval: Duration::from_secs(1800),
                peers: vec!["10.1.2.3:6881".parse().unwrap()],
            })
        }

        fn url(&self) -> &str {
            "http://flaky.test/announce"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff_then_succeeds() {
        let tracker: &'static FlakyTracker = Box::leak(Box::new(FlakyTracker {
            failures: Mutex::new(5),
            events: Mutex::new(Vec::new()),
        }));

        let (req_tx, mut req_rx) = mpsc::channel(8);
        let (addr_tx, mut addr_rx) = mpsc::channel(1);
        let (_completed_tx, completed_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = watch::channel(false);

        // Stand-in for the engine answering transfer snapshots.
        tokio::spawn(async move {
            while let Some(AnnouncerRequest { respond_to }) = req_rx.recv().await {
                let _ = respond_to.send(Transfer {
                    info_hash: InfoHash([0; 20]),
                    peer_id: PeerId::from_bytes([1; 20]),
                    port: 6881,
                    uploaded: 0,
                    downloaded: 0,
                    bytes_left: 1000,
                });
            }
        });

        let announcer = tokio::spawn(run_announcer(
            Box::new(TrackerRef(tracker)),
            req_tx,
            addr_tx,
            completed_rx,
            stop_rx,
        ));

        // The sixth attempt succeeds and pushes peers.
        let peers = addr_rx.recv().await.unwrap();
        assert_eq!(peers, vec!["10.1.2.3:6881".parse().unwrap()]);

        let events = tracker.events.lock().unwrap().clone();
        assert_eq!(events.len(), 6);
        let started_count = events
            .iter()
            .filter(|(e, _)| *e == Event::Started)
            .count();
        assert_eq!(started_count, 1, "exactly one Started event");

        // Retry gaps stay inside the 5 s .. 30 min backoff envelope.
        let mut expected = Duration::from_secs(5);
        for pair in events.windows(2) {
            let gap = pair[1].1 - pair[0].1;
            assert!(gap >= expected.mul_f64(0.5));
            assert!(gap <= expected.mul_f64(1.5));
            expected = expected.mul_f64(2.0);
        }

        let _ = stop_tx.send(true);
        announcer.await.unwrap();
        let events = tracker.events.lock().unwrap().clone();
        assert_eq!(events.last().unwrap().0, Event::Stopped);
    }

    struct TrackerRef(&'static FlakyTracker);

    #[async_trait]
    impl Tracker for TrackerRef {
        async fn announce(
            &self,
            transfer: &Transfer,
            event: Event,
        ) -> Result<Announce, TrackerError> {
            self.0.announce(transfer, event).await
        }

        fn url(&self) -> &str {
            self.0.url()
        }
    }
}
