//! Start barrier for nodes that were launched independently. Every participant announces itself
//! with READY; once the configured number of distinct nodes have done so, the coordinator waits
//! a settle delay and broadcasts a single SYNC. Each participant then derives its start time from
//! its own (PPS-disciplined) hardware clock.

use crate::bus::{
    BusMessage, Publisher, Replier, Requester, Subscriber, TcpPublisher, TcpReplier,
    TcpRequester, TcpSubscriber,
};
use crate::config::RendezvousConfig;
use crate::error::SyncError;
use crate::radio::HardwareClock;
use failure::Error;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long one blocking bus call may take, so deadlines and the abort flag are checked regularly
const SERVE_SLICE: Duration = Duration::from_millis(100);

/// Outcome of one barrier round
#[derive(Clone, Debug, PartialEq)]
pub struct RoundReport {
    /// Node ids that announced themselves, in sorted order
    pub nodes: Vec<String>,
    /// Number of subscribers the SYNC was delivered to
    pub delivered: usize,
}

pub struct Coordinator<R, P> {
    replier: R,
    publisher: P,
    config: RendezvousConfig,
}

impl Coordinator<TcpReplier, TcpPublisher> {
    pub fn bind(config: &RendezvousConfig) -> Result<Self, Error> {
        let replier = TcpReplier::bind(config.request_addr.as_str())?;
        let publisher = TcpPublisher::bind(config.publish_addr.as_str())?;
        info!(
            request = %replier.local_addr()?,
            publish = %publisher.local_addr()?,
            "coordinator listening"
        );
        Ok(Self::new(replier, publisher, config.clone()))
    }

    pub fn replier(&self) -> &TcpReplier {
        &self.replier
    }

    pub fn publisher(&self) -> &TcpPublisher {
        &self.publisher
    }
}

impl<R: Replier, P: Publisher> Coordinator<R, P> {
    pub fn new(replier: R, publisher: P, config: RendezvousConfig) -> Self {
        Self {
            replier,
            publisher,
            config,
        }
    }

    /// Runs one barrier: collect READYs from `expected_nodes` distinct nodes, sleep the sync
    /// delay, publish SYNC exactly once.
    pub fn run_round(&mut self) -> Result<RoundReport, Error> {
        let expected = self.config.expected_nodes;
        let deadline = self.config.ready_timeout().map(|t| (Instant::now() + t, t));
        let mut ready = BTreeSet::new();

        info!(expected, "waiting for nodes");
        while ready.len() < expected {
            let slice = match deadline {
                Some((deadline, timeout)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SyncError::RendezvousTimeout {
                            timeout,
                            stage: "collecting READY",
                        }
                        .into());
                    }
                    SERVE_SLICE.min(deadline - now)
                }
                None => SERVE_SLICE,
            };
            self.replier.serve_one(slice, &mut |msg| match msg {
                BusMessage::Ready { node_id } => {
                    if ready.insert(node_id.clone()) {
                        info!(node = %node_id, count = ready.len(), "node ready");
                    } else {
                        debug!(node = %node_id, "duplicate READY");
                    }
                    Some(BusMessage::Ok)
                }
                other => {
                    warn!(?other, "ignoring unexpected request");
                    None
                }
            })?;
        }

        std::thread::sleep(self.config.sync_delay());
        let delivered = self.publisher.publish(&BusMessage::Sync)?;
        info!(delivered, "SYNC sent");
        Ok(RoundReport {
            nodes: ready.into_iter().collect(),
            delivered,
        })
    }
}

pub struct Participant<Q, S> {
    node_id: String,
    requester: Q,
    subscriber: S,
    config: RendezvousConfig,
}

impl Participant<TcpRequester, TcpSubscriber> {
    /// Subscribes to the broadcast before anything is announced, so a SYNC cannot be missed
    pub fn connect(node_id: &str, config: &RendezvousConfig) -> Result<Self, Error> {
        let subscriber = TcpSubscriber::connect(config.publish_addr.as_str(), config.sync_timeout())?;
        let requester = TcpRequester::new(&config.request_addr);
        Ok(Self::new(node_id, requester, subscriber, config.clone()))
    }
}

impl<Q: Requester, S: Subscriber> Participant<Q, S> {
    pub fn new(node_id: &str, requester: Q, subscriber: S, config: RendezvousConfig) -> Self {
        Self {
            node_id: node_id.to_string(),
            requester,
            subscriber,
            config,
        }
    }

    /// Announces READY, waits for SYNC and returns the common start time on `clock`. The whole
    /// exchange is bounded by the configured sync timeout.
    pub fn wait_for_sync<C: HardwareClock>(&mut self, clock: &C) -> Result<f64, Error> {
        self.wait_for_sync_or_abort(clock, &AtomicBool::new(false))
    }

    /// Like `wait_for_sync`, but gives up with `Aborted` once `abort` is raised. The flag is
    /// checked before READY and between slices of the SYNC wait.
    pub fn wait_for_sync_or_abort<C: HardwareClock>(
        &mut self,
        clock: &C,
        abort: &AtomicBool,
    ) -> Result<f64, Error> {
        let timeout = self.config.sync_timeout();
        let deadline = Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(Instant::now());
        let aborted = |stage| -> Result<f64, Error> { Err(SyncError::Aborted { stage }.into()) };

        if abort.load(Ordering::Relaxed) {
            return aborted("announcing READY");
        }
        let ready = BusMessage::Ready {
            node_id: self.node_id.clone(),
        };
        match self.requester.request(&ready, remaining())? {
            Some(BusMessage::Ok) => debug!(node = %self.node_id, "READY acknowledged"),
            Some(other) => return Err(SyncError::UnexpectedMessage(format!("{:?}", other)).into()),
            None => {
                return Err(SyncError::RendezvousTimeout {
                    timeout,
                    stage: "waiting for OK",
                }
                .into())
            }
        }

        loop {
            if abort.load(Ordering::Relaxed) {
                return aborted("waiting for SYNC");
            }
            let left = remaining();
            if left == Duration::from_secs(0) {
                return Err(SyncError::RendezvousTimeout {
                    timeout,
                    stage: "waiting for SYNC",
                }
                .into());
            }
            match self.subscriber.recv(SERVE_SLICE.min(left))? {
                Some(BusMessage::Sync) => {
                    let start = clock.time_now() + self.config.start_offset_secs;
                    info!(node = %self.node_id, start, "SYNC received");
                    return Ok(start);
                }
                Some(other) => {
                    return Err(SyncError::UnexpectedMessage(format!("{:?}", other)).into())
                }
                None => (),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{SimConfig, SimulatedRadio};
    use std::sync::mpsc;

    fn local_config(expected_nodes: usize) -> RendezvousConfig {
        RendezvousConfig {
            expected_nodes,
            sync_delay_secs: 0.05,
            sync_timeout_secs: 5.0,
            request_addr: "127.0.0.1:0".into(),
            publish_addr: "127.0.0.1:0".into(),
            ..RendezvousConfig::default()
        }
    }

    fn bound(config: &RendezvousConfig) -> (Coordinator<TcpReplier, TcpPublisher>, RendezvousConfig) {
        let coordinator = Coordinator::bind(config).unwrap();
        let mut client = config.clone();
        client.request_addr = coordinator.replier().local_addr().unwrap().to_string();
        client.publish_addr = coordinator.publisher().local_addr().unwrap().to_string();
        (coordinator, client)
    }

    #[test]
    fn sync_only_after_all_nodes_ready() {
        let (mut coordinator, client) = bound(&local_config(2));
        let server = std::thread::spawn(move || coordinator.run_round().unwrap());

        let (tx, rx) = mpsc::channel();
        let early = {
            let client = client.clone();
            let tx = tx.clone();
            std::thread::spawn(move || {
                let clock = SimulatedRadio::new(SimConfig::default());
                let mut p = Participant::connect("a", &client).unwrap();
                let start = p.wait_for_sync(&clock).unwrap();
                tx.send(("a-sync", Instant::now())).unwrap();
                start
            })
        };

        std::thread::sleep(Duration::from_millis(300));
        let clock = SimulatedRadio::new(SimConfig {
            initial_time: 10.0,
            ..SimConfig::default()
        });
        let mut late = Participant::connect("b", &client).unwrap();
        let b_ready = Instant::now();
        let b_start = late.wait_for_sync(&clock).unwrap();

        let a_start = early.join().unwrap();
        let (_, a_sync) = rx.recv().unwrap();
        assert!(a_sync >= b_ready);
        assert!(a_start >= 1.0 && a_start < 2.0);
        assert!(b_start >= 11.0 && b_start < 12.0);

        let report = server.join().unwrap();
        assert_eq!(report.nodes, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(report.delivered, 2);
    }

    #[test]
    fn duplicates_are_acknowledged_but_not_counted() {
        let (mut coordinator, client) = bound(&local_config(2));
        let mut sub = TcpSubscriber::connect(client.publish_addr.as_str(), Duration::from_secs(1)).unwrap();
        let server = std::thread::spawn(move || coordinator.run_round().unwrap());

        let mut req = TcpRequester::new(&client.request_addr);
        let ready = |id: &str| BusMessage::Ready { node_id: id.into() };
        for _ in 0..3 {
            assert_eq!(
                req.request(&ready("a"), Duration::from_secs(2)).unwrap(),
                Some(BusMessage::Ok)
            );
        }
        assert_eq!(sub.recv(Duration::from_millis(200)).unwrap(), None);

        req.request(&ready("b"), Duration::from_secs(2)).unwrap();
        assert_eq!(sub.recv(Duration::from_secs(2)).unwrap(), Some(BusMessage::Sync));
        assert_eq!(server.join().unwrap().nodes.len(), 2);
        // Exactly one SYNC per round
        assert!(sub.recv(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn participant_gives_up_without_sync() {
        let mut config = local_config(2);
        config.sync_timeout_secs = 0.3;
        let (mut coordinator, client) = bound(&config);
        // Serve the READY but never reach the expected count
        let server = std::thread::spawn(move || {
            coordinator
                .replier
                .serve_one(Duration::from_secs(2), &mut |_| Some(BusMessage::Ok))
                .unwrap();
            coordinator
        });
        let clock = SimulatedRadio::new(SimConfig::default());
        let mut p = Participant::connect("lonely", &client).unwrap();
        let err = p.wait_for_sync(&clock).unwrap_err();
        match err.downcast_ref::<SyncError>() {
            Some(SyncError::RendezvousTimeout { stage, .. }) => assert_eq!(*stage, "waiting for SYNC"),
            other => panic!("unexpected error {:?}", other),
        }
        drop(server.join().unwrap());
    }

    #[test]
    fn participant_stops_waiting_when_aborted() {
        let (mut coordinator, client) = bound(&local_config(2));
        let server = std::thread::spawn(move || {
            coordinator
                .replier
                .serve_one(Duration::from_secs(2), &mut |_| Some(BusMessage::Ok))
                .unwrap();
            coordinator
        });
        let abort = std::sync::Arc::new(AtomicBool::new(false));
        let raiser = {
            let abort = abort.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(300));
                abort.store(true, Ordering::Relaxed);
            })
        };
        let clock = SimulatedRadio::new(SimConfig::default());
        let mut p = Participant::connect("impatient", &client).unwrap();
        let started = Instant::now();
        let err = p.wait_for_sync_or_abort(&clock, &abort).unwrap_err();
        // Well before the 5 s sync timeout
        assert!(started.elapsed() < Duration::from_secs(2));
        match err.downcast_ref::<SyncError>() {
            Some(SyncError::Aborted { stage }) => assert_eq!(*stage, "waiting for SYNC"),
            other => panic!("unexpected error {:?}", other),
        }
        raiser.join().unwrap();
        drop(server.join().unwrap());
    }

    #[test]
    fn coordinator_ready_timeout() {
        let mut config = local_config(3);
        config.ready_timeout_secs = Some(0.2);
        let (mut coordinator, _) = bound(&config);
        let err = coordinator.run_round().unwrap_err();
        match err.downcast_ref::<SyncError>() {
            Some(SyncError::RendezvousTimeout { .. }) => (),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
