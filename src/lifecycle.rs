//! The authoritative backend lifecycle state machine.
//!
//! All state mutation happens in one dedicated task that consumes a single
//! event channel; listeners, the oracle, power-command completions and
//! forwarders are producers on that channel, which makes event arrival
//! order the linearization point. External readers get snapshots through a
//! watch channel.

use crate::config::Settings;
use crate::error::RejectReason;
use crate::forward::{self, FlightGuard};
use crate::idle::IdleAccountant;
use crate::ipmi::PowerEffector;
use crate::oracle::ObservedSignal;
use crate::queue::{AdmissionQueue, PendingIntent};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Authoritative backend state. Exactly one instance per process, owned by
/// the machine task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Off,
    Starting,
    Ready,
    Stopping,
}

/// Power command dispatched through the effector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCmd {
    On,
    Soft,
}

/// Everything the machine reacts to.
#[derive(Debug)]
pub enum Event {
    /// A listener accepted a connection
    Intent(PendingIntent),
    /// The oracle observed the backend
    Observed(ObservedSignal),
    /// An issued power command completed
    PowerCmdDone { cmd: PowerCmd, ok: bool },
    /// A forwarder could not reach the backend
    DialFailed(PendingIntent),
    /// The supervisor is shutting the proxy down
    Shutdown,
}

/// Shared handles produced alongside a [`Machine`].
pub struct MachineHandles {
    pub events_tx: mpsc::Sender<Event>,
    pub state_rx: watch::Receiver<LifecycleState>,
    pub idle: Arc<IdleAccountant>,
    pub in_flight: Arc<AtomicUsize>,
}

pub struct Machine<E> {
    settings: Settings,
    target_host: String,
    effector: Arc<E>,
    events_rx: mpsc::Receiver<Event>,
    events_tx: mpsc::Sender<Event>,
    state: LifecycleState,
    state_tx: watch::Sender<LifecycleState>,
    queue: AdmissionQueue,
    idle: Arc<IdleAccountant>,
    in_flight: Arc<AtomicUsize>,
    /// At most one power command is in flight at any time
    power_cmd_busy: bool,
    /// Power-on attempts within the current startup window
    power_on_attempts: u32,
    startup_deadline: Option<Instant>,
}

impl<E: PowerEffector> Machine<E> {
    pub fn new(
        settings: Settings,
        target_host: String,
        effector: Arc<E>,
    ) -> (Self, MachineHandles) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(LifecycleState::Off);
        let idle = Arc::new(IdleAccountant::new());
        let in_flight = Arc::new(AtomicUsize::new(0));

        let handles = MachineHandles {
            events_tx: events_tx.clone(),
            state_rx,
            idle: Arc::clone(&idle),
            in_flight: Arc::clone(&in_flight),
        };

        let queue = AdmissionQueue::new(settings.max_queue_size);
        let machine = Self {
            settings,
            target_host,
            effector,
            events_rx,
            events_tx,
            state: LifecycleState::Off,
            state_tx,
            queue,
            idle,
            in_flight,
            power_cmd_busy: false,
            power_on_attempts: 0,
            startup_deadline: None,
        };

        (machine, handles)
    }

    /// Consume events until shutdown. The event-channel arm is polled first
    /// so an arriving connection always wins a race against the idle timer.
    pub async fn run(mut self) {
        let mut expiry_tick = time::interval(self.settings.check_interval);
        expiry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let startup_deadline = self
                .startup_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));
            let idle_deadline = self.idle.deadline(self.settings.inactivity_timeout);

            tokio::select! {
                biased;

                event = self.events_rx.recv() => {
                    match event {
                        Some(Event::Shutdown) | None => {
                            self.fail_queue(RejectReason::ShuttingDown);
                            break;
                        }
                        Some(event) => self.handle(event),
                    }
                }

                _ = time::sleep_until(startup_deadline),
                    if self.state == LifecycleState::Starting =>
                {
                    self.on_startup_deadline();
                }

                _ = time::sleep_until(idle_deadline),
                    if self.state == LifecycleState::Ready =>
                {
                    self.on_idle_deadline();
                }

                _ = expiry_tick.tick() => {
                    self.expire_due();
                }
            }
        }

        info!("Lifecycle state machine stopped");
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Intent(intent) => self.on_intent(intent),
            Event::Observed(signal) => self.on_observed(signal),
            Event::PowerCmdDone { cmd, ok } => self.on_power_done(cmd, ok),
            Event::DialFailed(intent) => self.on_dial_failed(intent),
            Event::Shutdown => {}
        }
    }

    fn on_intent(&mut self, intent: PendingIntent) {
        match self.state {
            LifecycleState::Off => {
                debug!(intent = %intent.id, "Connection arrived while backend is off");
                self.enqueue(intent);
                self.power_on_attempts = 0;
                self.issue_power(PowerCmd::On);
                self.enter_starting("cold start");
            }
            LifecycleState::Starting | LifecycleState::Stopping => {
                self.enqueue(intent);
            }
            LifecycleState::Ready => {
                self.idle.touch();
                self.spawn_forwarder(intent);
            }
        }
    }

    fn on_observed(&mut self, signal: ObservedSignal) {
        use LifecycleState::*;
        use ObservedSignal as S;

        match (self.state, signal) {
            (_, S::Unknown) => {}

            (Off, S::Off) | (Starting, S::Starting) | (Ready, S::Ready) => {}

            (Off, S::Starting) => self.enter_starting("observed power-on"),
            (Off, S::Ready) => self.enter_ready(),

            // Power-on may not have propagated yet; keep waiting for the
            // startup deadline to decide.
            (Starting, S::Off) => {}
            (Starting, S::Ready) => self.enter_ready(),

            (Ready, S::Off) => {
                warn!("Backend power lost unexpectedly, dropping forwarders");
                self.enter_off();
            }
            (Ready, S::Starting) => {
                warn!("Backend stopped answering while powered on");
                self.enter_starting("lost reachability");
            }

            (Stopping, S::Off) => {
                self.enter_off();
                self.restart_if_queued();
            }
            (Stopping, S::Starting) => self.enter_starting("observed during stop"),
            (Stopping, S::Ready) => self.enter_ready(),
        }
    }

    fn on_power_done(&mut self, cmd: PowerCmd, ok: bool) {
        self.power_cmd_busy = false;

        match (cmd, ok) {
            (PowerCmd::On, true) => {
                debug!("Power-on acknowledged, waiting for the backend to answer");
            }
            (PowerCmd::On, false) => {
                if self.state != LifecycleState::Starting {
                    return;
                }
                if !self.queue.is_empty() && self.power_on_attempts < 2 {
                    warn!(
                        attempt = self.power_on_attempts + 1,
                        "Power-on failed, retrying once"
                    );
                    self.issue_power(PowerCmd::On);
                } else {
                    warn!("Power-on failed, abandoning startup");
                    self.fail_queue(RejectReason::StartTimeout);
                    self.enter_off();
                }
            }
            (PowerCmd::Soft, ok) => {
                if !ok {
                    warn!("Soft power-off failed, waiting for the next observation");
                }
                if ok && self.state == LifecycleState::Stopping {
                    self.enter_off();
                    self.restart_if_queued();
                } else if self.state == LifecycleState::Starting && !self.queue.is_empty() {
                    // A restart was requested while the soft-off was still
                    // in flight, so its power-on could not be issued then.
                    self.issue_power(PowerCmd::On);
                }
            }
        }
    }

    /// Dial failures in READY surface immediately; outside READY the
    /// backend likely flapped mid-startup, so the intent is held again for
    /// the next drain, once.
    fn on_dial_failed(&mut self, mut intent: PendingIntent) {
        if self.state == LifecycleState::Ready || intent.redialed {
            self.fail_intent(intent, RejectReason::DialFailed);
        } else {
            debug!(intent = %intent.id, "Dial failed mid-transition, holding connection again");
            intent.redialed = true;
            let was_off = self.state == LifecycleState::Off;
            self.enqueue(intent);
            // The backend lost power between the release and the dial;
            // a held connection in OFF needs a fresh cycle.
            if was_off && !self.queue.is_empty() {
                self.power_on_attempts = 0;
                self.issue_power(PowerCmd::On);
                self.enter_starting("redial after power loss");
            }
        }
    }

    fn on_startup_deadline(&mut self) {
        warn!(
            timeout_secs = self.settings.startup_timeout.as_secs_f64(),
            "Backend did not become ready in time"
        );
        self.fail_queue(RejectReason::StartTimeout);
        self.enter_off();
    }

    fn on_idle_deadline(&mut self) {
        // The stamp may have advanced after the timer was armed.
        if Instant::now() < self.idle.deadline(self.settings.inactivity_timeout) {
            return;
        }
        info!(
            idle_secs = self.idle.idle_for().as_secs_f64(),
            "Backend idle, requesting soft power-off"
        );
        self.set_state(LifecycleState::Stopping);
        self.issue_power(PowerCmd::Soft);
    }

    fn enter_starting(&mut self, why: &str) {
        self.set_state(LifecycleState::Starting);
        self.startup_deadline = Some(Instant::now() + self.settings.startup_timeout);
        info!(why, "Waiting for backend startup");
    }

    fn enter_ready(&mut self) {
        self.startup_deadline = None;
        self.power_on_attempts = 0;
        self.set_state(LifecycleState::Ready);
        self.idle.touch();
        self.drain_queue();
    }

    fn enter_off(&mut self) {
        self.startup_deadline = None;
        self.set_state(LifecycleState::Off);
    }

    /// After reaching OFF with connections still held, start a fresh cycle.
    fn restart_if_queued(&mut self) {
        self.expire_due();
        if !self.queue.is_empty() {
            info!(
                queued = self.queue.len(),
                "Held connections present, powering backend back on"
            );
            self.power_on_attempts = 0;
            self.issue_power(PowerCmd::On);
            self.enter_starting("held connections after power-off");
        }
    }

    fn set_state(&mut self, next: LifecycleState) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, "Lifecycle transition");
            self.state = next;
            let _ = self.state_tx.send(next);
        }
    }

    fn enqueue(&mut self, intent: PendingIntent) {
        match self.queue.offer(intent) {
            Ok(()) => debug!(queued = self.queue.len(), "Connection held"),
            Err(intent) => {
                warn!(
                    intent = %intent.id,
                    capacity = self.settings.max_queue_size,
                    "Admission queue full, rejecting connection"
                );
                self.fail_intent(intent, RejectReason::QueueFull);
            }
        }
    }

    /// Release all held connections, oldest first. Expired ones fail;
    /// the rest are handed off sequentially while their forwarders run
    /// concurrently.
    fn drain_queue(&mut self) {
        let now = Instant::now();
        let intents = self.queue.take_all();
        if intents.is_empty() {
            return;
        }
        info!(count = intents.len(), "Releasing held connections");
        for intent in intents {
            if intent.expired(now) {
                self.fail_intent(intent, RejectReason::DeadlineExpired);
            } else {
                self.spawn_forwarder(intent);
            }
        }
    }

    fn expire_due(&mut self) {
        for intent in self.queue.expire_due(Instant::now()) {
            warn!(intent = %intent.id, "Held connection exceeded its deadline");
            self.fail_intent(intent, RejectReason::DeadlineExpired);
        }
    }

    fn fail_queue(&mut self, reason: RejectReason) {
        let intents = self.queue.take_all();
        if intents.is_empty() {
            return;
        }
        warn!(count = intents.len(), ?reason, "Failing all held connections");
        for intent in intents {
            self.fail_intent(intent, reason);
        }
    }

    fn fail_intent(&self, intent: PendingIntent, reason: RejectReason) {
        debug!(intent = %intent.id, ?reason, "Rejecting connection");
        let PendingIntent { id, stream, .. } = intent;
        crate::error::reject(stream, id, reason);
    }

    fn spawn_forwarder(&self, intent: PendingIntent) {
        let guard = FlightGuard::new(&self.in_flight);
        let target_host = self.target_host.clone();
        let dial_cap = self.settings.dial_timeout;
        let idle = Arc::clone(&self.idle);
        let events_tx = self.events_tx.clone();
        tokio::spawn(forward::run(
            intent, target_host, dial_cap, idle, events_tx, guard,
        ));
    }

    fn issue_power(&mut self, cmd: PowerCmd) {
        if self.power_cmd_busy {
            debug!(?cmd, "Power command already in flight, not issuing another");
            return;
        }
        self.power_cmd_busy = true;
        if cmd == PowerCmd::On {
            self.power_on_attempts += 1;
        }
        info!(?cmd, "Issuing power command");

        let effector = Arc::clone(&self.effector);
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = match cmd {
                PowerCmd::On => effector.power_on().await,
                PowerCmd::Soft => effector.power_soft().await,
            };
            let ok = match result {
                Ok(()) => true,
                Err(e) => {
                    warn!(?cmd, error = %e, "Power command failed");
                    false
                }
            };
            let _ = events_tx.send(Event::PowerCmdDone { cmd, ok }).await;
        });
    }
}
