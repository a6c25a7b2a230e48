//! Two-party registration handshake with retry budget
//!
//! The initiator sends `Register` carrying its address and an opaque payload,
//! then re-sends on an interval until `Registered` arrives or the budget is
//! exhausted. The target decides whether to reply; replying implicitly
//! starts the heartbeat observer armed for the caller. Reliability lives
//! entirely in the retry timer: the envelopes themselves are fire-and-forget.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::bus::NodeBus;
use crate::domain_types::EndpointAddress;
use crate::heartbeat::{HeartbeatObserver, PING_PONG_SUFFIX, PingResponder, TimeoutHandler};
use crate::messages::Envelope;

/// Suffix appended to a coordinator's name for its bus endpoint.
pub const REGISTER_HELPER_SUFFIX: &str = "-register-helper";

/// Default interval between register retries.
pub const DEFAULT_REGISTER_INTERVAL: Duration = Duration::from_millis(1000);

/// Ping budget used when a registered-reply arms a heartbeat observer.
pub const REGISTERED_HEARTBEAT_PINGS: u32 = 12;

/// Callback on the target side for each received `Register`.
pub type RegisterCallback = Arc<dyn Fn(EndpointAddress, String) + Send + Sync>;
/// Callback on the initiator side when the handshake completes.
pub type RegisteredCallback = Arc<dyn Fn(String) + Send + Sync>;
/// Callback on the initiator side when the retry budget is exhausted.
pub type RegisterTimeoutCallback = Arc<dyn Fn() + Send + Sync>;

/// One side of the registration handshake; either role uses the same type.
/// Handles are cheap clones over shared state.
#[derive(Clone)]
pub struct RegistrationCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    name: String,
    bus: Arc<NodeBus>,
    register_interval: Duration,
    receive_registered: AtomicBool,
    on_register: Mutex<Option<RegisterCallback>>,
    on_registered: Mutex<Option<RegisteredCallback>>,
    on_register_timeout: Mutex<Option<RegisterTimeoutCallback>>,
    registered_from: Mutex<Option<EndpointAddress>>,
    armed_heartbeat: Mutex<Option<Arc<HeartbeatObserver>>>,
    ping_responder: Mutex<Option<PingResponder>>,
}

impl RegistrationCoordinator {
    /// Creates the coordinator and starts consuming its bus endpoint.
    pub fn spawn(name: impl Into<String>, bus: Arc<NodeBus>, register_interval: Duration) -> Self {
        let name = name.into();
        let inner = Arc::new(CoordinatorInner {
            name: name.clone(),
            bus: Arc::clone(&bus),
            register_interval,
            receive_registered: AtomicBool::new(false),
            on_register: Mutex::new(None),
            on_registered: Mutex::new(None),
            on_register_timeout: Mutex::new(None),
            registered_from: Mutex::new(None),
            armed_heartbeat: Mutex::new(None),
            ping_responder: Mutex::new(None),
        });
        let mut inbox = bus.register_endpoint(&inner.endpoint_name());
        let receive = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                receive.handle(envelope).await;
            }
        });
        Self { inner }
    }

    /// Endpoint name this coordinator is addressed by.
    #[must_use]
    pub fn endpoint_name(&self) -> String {
        self.inner.endpoint_name()
    }

    /// Whether a `Registered` reply has been observed since the last
    /// `start_register`.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.inner.receive_registered.load(Ordering::SeqCst)
    }

    pub async fn set_register_callback(&self, callback: RegisterCallback) {
        *self.inner.on_register.lock().await = Some(callback);
    }

    pub async fn set_registered_callback(&self, callback: RegisteredCallback) {
        *self.inner.on_registered.lock().await = Some(callback);
    }

    pub async fn set_register_timeout_callback(&self, callback: RegisterTimeoutCallback) {
        *self.inner.on_register_timeout.lock().await = Some(callback);
    }

    /// Starts answering the peer's heartbeat pings under this coordinator's
    /// endpoint name.
    pub async fn start_ping_responder(&self) {
        let mut guard = self.inner.ping_responder.lock().await;
        if guard.is_none() {
            *guard = Some(PingResponder::start(
                &self.inner.endpoint_name(),
                Arc::clone(&self.inner.bus),
            ));
        }
    }

    /// Builds (without starting) the heartbeat observer that a subsequent
    /// [`Self::send_registered`] will arm, pointed at the peer coordinator.
    ///
    /// `timeout` is the total detection window; it is divided across
    /// [`REGISTERED_HEARTBEAT_PINGS`] pings as the original handshake did.
    pub async fn arm_heartbeat_observer(
        &self,
        peer_name: &str,
        peer_address: &str,
        timeout: Duration,
        handler: TimeoutHandler,
    ) {
        let target = EndpointAddress::new(
            format!("{peer_name}{REGISTER_HELPER_SUFFIX}{PING_PONG_SUFFIX}"),
            peer_address,
        );
        let observer = Arc::new(HeartbeatObserver::new(
            self.inner.endpoint_name(),
            target,
            REGISTERED_HEARTBEAT_PINGS,
            timeout / REGISTERED_HEARTBEAT_PINGS,
            handler,
            Arc::clone(&self.inner.bus),
        ));
        let mut guard = self.inner.armed_heartbeat.lock().await;
        if let Some(previous) = guard.take() {
            previous.stop().await;
        }
        *guard = Some(observer);
    }

    /// Sends `Register` to the peer and retries on the configured interval
    /// until `Registered` arrives or `max_registers` sends are exhausted.
    pub fn start_register(
        &self,
        peer_name: &str,
        peer_address: &str,
        payload: String,
        max_registers: u32,
    ) {
        self.inner.receive_registered.store(false, Ordering::SeqCst);
        let peer = EndpointAddress::new(format!("{peer_name}{REGISTER_HELPER_SUFFIX}"), peer_address);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let from = inner.bus.address_of(&inner.endpoint_name());
            for remaining in (0..max_registers).rev() {
                debug!(to = %peer, "send Register");
                inner.bus.send(
                    &peer,
                    Envelope::Register {
                        from: from.clone(),
                        payload: payload.clone(),
                    },
                );
                tokio::time::sleep(inner.register_interval).await;
                if inner.receive_registered.load(Ordering::SeqCst) {
                    info!(to = %peer, "registration already succeeded");
                    return;
                }
                if remaining > 0 {
                    error!(to = %peer, remaining, "no Registered reply yet, retrying");
                }
            }
            error!(to = %peer, "register timeout, exceeded max retry budget");
            let callback = inner.on_register_timeout.lock().await.clone();
            match callback {
                Some(callback) => callback(),
                None => warn!("register timeout callback is not set"),
            }
        });
    }

    /// Replies `Registered` to the peer and starts the armed heartbeat
    /// observer, if one was built.
    pub async fn send_registered(&self, peer_name: &str, peer_address: &str, payload: String) {
        let peer = EndpointAddress::new(format!("{peer_name}{REGISTER_HELPER_SUFFIX}"), peer_address);
        debug!(to = %peer, "send Registered");
        self.inner.bus.send(
            &peer,
            Envelope::Registered {
                from: self.inner.bus.address_of(&self.inner.endpoint_name()),
                payload,
            },
        );
        let guard = self.inner.armed_heartbeat.lock().await;
        match guard.as_ref() {
            Some(observer) => {
                info!(to = %peer, "starting heartbeat toward registered peer");
                observer.start();
            }
            None => info!(to = %peer, "no heartbeat observer armed"),
        }
    }

    /// Stops the heartbeat observer toward the peer, if running.
    pub async fn stop_heartbeat_observer(&self) {
        if let Some(observer) = self.inner.armed_heartbeat.lock().await.take() {
            observer.stop().await;
        }
    }

    /// The address the last `Registered` reply came from.
    pub async fn registered_from(&self) -> Option<EndpointAddress> {
        self.inner.registered_from.lock().await.clone()
    }
}

impl CoordinatorInner {
    fn endpoint_name(&self) -> String {
        format!("{}{REGISTER_HELPER_SUFFIX}", self.name)
    }

    async fn handle(&self, envelope: Envelope) {
        match envelope {
            Envelope::Register { from, payload } => {
                debug!(%from, "received Register");
                let callback = self.on_register.lock().await.clone();
                match callback {
                    Some(callback) => callback(from, payload),
                    None => warn!("register callback is not set"),
                }
            }
            Envelope::Registered { from, payload } => {
                debug!(%from, "received Registered");
                *self.registered_from.lock().await = Some(from);
                if self.receive_registered.swap(true, Ordering::SeqCst) {
                    debug!("already registered, swallowing duplicate Registered");
                    return;
                }
                let callback = self.on_registered.lock().await.clone();
                match callback {
                    Some(callback) => callback(payload),
                    None => warn!("registered callback is not set"),
                }
            }
            other => {
                warn!(?other, "unexpected envelope on registration endpoint");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::TimeoutReason;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicU32;

    async fn linked_coordinators(
        interval: Duration,
    ) -> (RegistrationCoordinator, RegistrationCoordinator) {
        let node_a = NodeBus::new("node-a");
        let node_b = NodeBus::new("node-b");
        NodeBus::link_pair(&node_a, &node_b);
        let initiator = RegistrationCoordinator::spawn("agent", node_a, interval);
        let target = RegistrationCoordinator::spawn("scheduler", node_b, interval);
        (initiator, target)
    }

    #[tokio::test]
    async fn test_happy_handshake_fires_registered_once() {
        let (initiator, target) = linked_coordinators(Duration::from_millis(20)).await;

        let registered_count = Arc::new(AtomicU32::new(0));
        let count_in = Arc::clone(&registered_count);
        initiator
            .set_registered_callback(Arc::new(move |payload| {
                assert_eq!(payload, "welcome");
                count_in.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        let target_inner = Arc::clone(&target.inner);
        target
            .set_register_callback(Arc::new(move |from, payload| {
                assert_eq!(payload, "hello");
                let inner = Arc::clone(&target_inner);
                tokio::spawn(async move {
                    inner.bus.send(
                        &from,
                        Envelope::Registered {
                            from: inner.bus.address_of(&inner.endpoint_name()),
                            payload: "welcome".to_string(),
                        },
                    );
                });
            }))
            .await;

        initiator.start_register("scheduler", "node-b", "hello".to_string(), 5);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(initiator.is_registered());
        // Every retry Register earns a Registered reply; the handler still
        // fires at most once per handshake.
        assert_eq!(registered_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_fires_timeout() {
        let node = NodeBus::new("node-a");
        let initiator =
            RegistrationCoordinator::spawn("agent", node, Duration::from_millis(10));

        let timed_out = Arc::new(AtomicU32::new(0));
        let flag = Arc::clone(&timed_out);
        initiator
            .set_register_timeout_callback(Arc::new(move || {
                flag.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        // Nobody is listening at node-b and no link exists.
        initiator.start_register("scheduler", "node-b", "hello".to_string(), 3);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(!initiator.is_registered());
        assert_eq!(timed_out.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registered_reply_starts_armed_heartbeat() {
        let (initiator, target) = linked_coordinators(Duration::from_millis(20)).await;

        // The initiator must answer pings once registered.
        initiator.start_ping_responder().await;

        let fired = Arc::new(StdMutex::new(Vec::<TimeoutReason>::new()));
        let fired_in = Arc::clone(&fired);
        target
            .arm_heartbeat_observer(
                "agent",
                "node-a",
                Duration::from_millis(240),
                Arc::new(move |_target, reason| {
                    fired_in.lock().expect("fired lock").push(reason);
                }),
            )
            .await;
        target
            .send_registered("agent", "node-a", "welcome".to_string())
            .await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(
            fired.lock().expect("fired lock").is_empty(),
            "responding peer must not be declared dead"
        );
        assert!(initiator.is_registered());

        target.stop_heartbeat_observer().await;
    }
}
