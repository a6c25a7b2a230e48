//! Heartbeat supervision between two named endpoints
//!
//! An observer sends a `Ping` to its target every `ping_cycle`; the target's
//! responder answers with `Pong`. Each cycle that elapses without a `Pong`
//! since the previous `Ping` increments a timeout counter; a `Pong` resets
//! it. When the counter reaches `max_ping_timeouts` the registered handler
//! fires exactly once with the target's address, and no further pings are
//! scheduled. A clean exit of the target endpoint fires the handler with a
//! distinct reason.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::bus::NodeBus;
use crate::domain_types::EndpointAddress;
use crate::error::Status;
use crate::messages::Envelope;

/// Suffix appended to an observer's name for its bus endpoint.
pub const HEARTBEAT_OBSERVER_SUFFIX: &str = "-heartbeat-observer";
/// Suffix appended to a responder's name for its bus endpoint.
pub const PING_PONG_SUFFIX: &str = "-pingpong";

/// Default missed-ping budget before the timeout handler fires.
pub const DEFAULT_MAX_PING_TIMEOUTS: u32 = 12;
/// Observer-set floor for the missed-ping budget.
pub const MIN_PING_TIMEOUTS: u32 = 5;
/// Observer-set floor for the ping cycle.
pub const MIN_PING_CYCLE: Duration = Duration::from_millis(1000);

/// Why the timeout handler fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    /// The missed-ping budget was exhausted.
    PingTimeout,
    /// The target endpoint unregistered cleanly.
    Exited,
}

/// Callback invoked once when the target is declared dead.
pub type TimeoutHandler = Arc<dyn Fn(EndpointAddress, TimeoutReason) + Send + Sync>;

/// Liveness prober bound to one target endpoint.
pub struct HeartbeatObserver {
    name: String,
    target: EndpointAddress,
    max_ping_timeouts: u32,
    ping_cycle: Duration,
    handler: TimeoutHandler,
    bus: Arc<NodeBus>,
    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
    task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HeartbeatObserver {
    /// Creates an observer with explicit parameters; no clamping is applied
    /// here so tests can run tight cycles. [`HeartbeatObserverSet`] applies
    /// the production floors.
    pub fn new(
        name: impl Into<String>,
        target: EndpointAddress,
        max_ping_timeouts: u32,
        ping_cycle: Duration,
        handler: TimeoutHandler,
        bus: Arc<NodeBus>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            target,
            max_ping_timeouts,
            ping_cycle,
            handler,
            bus,
            started: AtomicBool::new(false),
            stop_tx,
            task: std::sync::Mutex::new(None),
        }
    }

    /// Endpoint name this observer listens for pongs on.
    #[must_use]
    pub fn endpoint_name(&self) -> String {
        format!("{}{HEARTBEAT_OBSERVER_SUFFIX}", self.name)
    }

    /// Starts the ping loop. Idempotent: a second start is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!(name = %self.name, "heartbeat observer already started");
            return;
        }
        let endpoint = self.endpoint_name();
        let inbox = self.bus.register_endpoint(&endpoint);
        let exited = self.bus.watch_exit(&self.target.name);
        let loop_state = PingLoop {
            observer_address: self.bus.address_of(&endpoint),
            target: self.target.clone(),
            max_ping_timeouts: self.max_ping_timeouts,
            ping_cycle: self.ping_cycle,
            handler: Arc::clone(&self.handler),
            bus: Arc::clone(&self.bus),
        };
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop_state.run(inbox, exited, &mut stop_rx).await;
        });
        *self.task.lock().expect("heartbeat task lock") = Some(handle);
        info!(
            name = %self.name,
            target = %self.target,
            cycle_ms = self.ping_cycle.as_millis() as u64,
            budget = self.max_ping_timeouts,
            "heartbeat observer started"
        );
    }

    /// Cancels the next scheduled ping and waits for the loop to finish.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.task.lock().expect("heartbeat task lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.bus.unregister_endpoint(&self.endpoint_name());
    }
}

struct PingLoop {
    observer_address: EndpointAddress,
    target: EndpointAddress,
    max_ping_timeouts: u32,
    ping_cycle: Duration,
    handler: TimeoutHandler,
    bus: Arc<NodeBus>,
}

impl PingLoop {
    fn ping(&self) {
        self.bus.send(
            &self.target,
            Envelope::Ping {
                from: self.observer_address.clone(),
            },
        );
    }

    async fn run(
        self,
        mut inbox: mpsc::UnboundedReceiver<Envelope>,
        mut exited: tokio::sync::oneshot::Receiver<()>,
        stop_rx: &mut watch::Receiver<bool>,
    ) {
        let mut timeouts: u32 = 0;
        let mut pong_since_last_ping = false;
        self.ping();
        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        debug!(target = %self.target, "heartbeat observer stopped");
                        return;
                    }
                }
                _ = &mut exited => {
                    info!(target = %self.target, "heartbeat target exited");
                    (self.handler)(self.target.clone(), TimeoutReason::Exited);
                    return;
                }
                envelope = inbox.recv() => {
                    match envelope {
                        Some(Envelope::Pong { .. }) => {
                            timeouts = 0;
                            pong_since_last_ping = true;
                        }
                        Some(other) => {
                            warn!(target = %self.target, ?other, "unexpected envelope on heartbeat endpoint");
                        }
                        None => return,
                    }
                }
                () = tokio::time::sleep(self.ping_cycle) => {
                    if !pong_since_last_ping {
                        timeouts += 1;
                        if timeouts >= self.max_ping_timeouts {
                            warn!(
                                target = %self.target,
                                timeouts,
                                "heartbeat budget exhausted, declaring target dead"
                            );
                            (self.handler)(self.target.clone(), TimeoutReason::PingTimeout);
                            return;
                        }
                    }
                    pong_since_last_ping = false;
                    self.ping();
                }
            }
        }
    }
}

/// Answers `Ping` envelopes with `Pong` on behalf of a named peer.
pub struct PingResponder {
    endpoint: String,
    bus: Arc<NodeBus>,
    task: tokio::task::JoinHandle<()>,
}

impl PingResponder {
    /// Registers `{name}{PING_PONG_SUFFIX}` on the bus and starts answering.
    pub fn start(name: &str, bus: Arc<NodeBus>) -> Self {
        let endpoint = format!("{name}{PING_PONG_SUFFIX}");
        let mut inbox = bus.register_endpoint(&endpoint);
        let own_address = bus.address_of(&endpoint);
        let reply_bus = Arc::clone(&bus);
        let task = tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                if let Envelope::Ping { from } = envelope {
                    reply_bus.send(
                        &from,
                        Envelope::Pong {
                            from: own_address.clone(),
                        },
                    );
                }
            }
        });
        Self {
            endpoint,
            bus,
            task,
        }
    }

    /// Unregisters the endpoint, signalling a clean exit to observers.
    pub fn stop(self) {
        self.bus.unregister_endpoint(&self.endpoint);
        self.task.abort();
    }
}

/// Keyed collection of observers with production floors applied.
pub struct HeartbeatObserverSet {
    ping_times: u32,
    ping_cycle: Duration,
    bus: Arc<NodeBus>,
    observers: DashMap<String, Arc<HeartbeatObserver>>,
}

impl HeartbeatObserverSet {
    #[must_use]
    pub fn new(ping_times: u32, ping_cycle: Duration, bus: Arc<NodeBus>) -> Self {
        Self {
            ping_times: ping_times.max(MIN_PING_TIMEOUTS),
            ping_cycle: ping_cycle.max(MIN_PING_CYCLE),
            bus,
            observers: DashMap::new(),
        }
    }

    /// Builds and starts an observer for `id`. Idempotent per id.
    pub fn add(&self, id: &str, address: &str, handler: TimeoutHandler) -> Status {
        if self.observers.contains_key(id) {
            info!(id, "heartbeat for peer already built");
            return Status::ok();
        }
        let target = EndpointAddress::new(format!("{id}{PING_PONG_SUFFIX}"), address);
        let observer = Arc::new(HeartbeatObserver::new(
            id,
            target,
            self.ping_times,
            self.ping_cycle,
            handler,
            Arc::clone(&self.bus),
        ));
        observer.start();
        self.observers.insert(id.to_string(), observer);
        Status::ok()
    }

    /// Stops and removes the observer for `id`, if any.
    pub async fn remove(&self, id: &str) {
        if let Some((_, observer)) = self.observers.remove(id) {
            observer.stop().await;
            info!(id, "disconnected heartbeat for peer");
        }
    }

    /// Whether an observer exists for `id`.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.observers.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    fn counting_handler() -> (TimeoutHandler, Arc<AtomicU32>, Arc<Mutex<Vec<TimeoutReason>>>) {
        let count = Arc::new(AtomicU32::new(0));
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let count_in = Arc::clone(&count);
        let reasons_in = Arc::clone(&reasons);
        let handler: TimeoutHandler = Arc::new(move |_target, reason| {
            count_in.fetch_add(1, Ordering::SeqCst);
            reasons_in.lock().expect("reasons lock").push(reason);
        });
        (handler, count, reasons)
    }

    #[tokio::test]
    async fn test_timeout_fires_exactly_once_after_budget() {
        let bus = NodeBus::new("node-a");
        let (handler, count, reasons) = counting_handler();
        // Target never answers: no responder is registered.
        let observer = HeartbeatObserver::new(
            "watcher",
            EndpointAddress::new("silent-pingpong", "node-a"),
            5,
            Duration::from_millis(10),
            handler,
            Arc::clone(&bus),
        );

        let started = Instant::now();
        observer.start();
        // Five missed cycles of 10ms each; wait long enough to observe any
        // erroneous second firing as well.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(started.elapsed() >= Duration::from_millis(50));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(
            reasons.lock().expect("reasons lock").as_slice(),
            &[TimeoutReason::PingTimeout]
        );
    }

    #[tokio::test]
    async fn test_pong_resets_timeout_counter() {
        let bus = NodeBus::new("node-a");
        let responder = PingResponder::start("lively", Arc::clone(&bus));
        let (handler, count, _) = counting_handler();
        let observer = HeartbeatObserver::new(
            "watcher",
            bus.address_of(&format!("lively{PING_PONG_SUFFIX}")),
            3,
            Duration::from_millis(10),
            handler,
            Arc::clone(&bus),
        );

        observer.start();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "live target must not time out");

        responder.stop();
        observer.stop().await;
    }

    #[tokio::test]
    async fn test_target_exit_fires_with_exited_reason() {
        let bus = NodeBus::new("node-a");
        let responder = PingResponder::start("shortlived", Arc::clone(&bus));
        let (handler, count, reasons) = counting_handler();
        let observer = HeartbeatObserver::new(
            "watcher",
            bus.address_of(&format!("shortlived{PING_PONG_SUFFIX}")),
            5,
            Duration::from_millis(20),
            handler,
            Arc::clone(&bus),
        );
        observer.start();
        tokio::time::sleep(Duration::from_millis(30)).await;

        responder.stop();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(
            reasons.lock().expect("reasons lock").as_slice(),
            &[TimeoutReason::Exited]
        );
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_cancels() {
        let bus = NodeBus::new("node-a");
        let (handler, count, _) = counting_handler();
        let observer = HeartbeatObserver::new(
            "watcher",
            EndpointAddress::new("silent-pingpong", "node-a"),
            5,
            Duration::from_millis(50),
            handler,
            Arc::clone(&bus),
        );
        observer.start();
        observer.start();
        observer.stop().await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "stopped observer must not fire");
    }

    #[tokio::test]
    async fn test_observer_set_clamps_and_deduplicates() {
        let bus = NodeBus::new("node-a");
        let set = HeartbeatObserverSet::new(1, Duration::from_millis(1), Arc::clone(&bus));
        assert_eq!(set.ping_times, MIN_PING_TIMEOUTS);
        assert_eq!(set.ping_cycle, MIN_PING_CYCLE);

        let (handler, _, _) = counting_handler();
        assert!(set.add("peer", "node-a", Arc::clone(&handler)).is_ok());
        assert!(set.add("peer", "node-a", handler).is_ok());
        assert!(set.contains("peer"));

        set.remove("peer").await;
        assert!(!set.contains("peer"));
    }
}
