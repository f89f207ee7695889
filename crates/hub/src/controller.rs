//! Decision controller: reconciles the grow light and the irrigation pump
//! against the latest reported state.
//!
//! Every tick reads one snapshot, decides the light from current inputs
//! alone, advances each pump slot, and publishes only the commands needed
//! to move a reported relay state towards the desired one. It never waits
//! for a command to take effect; the next tick simply re-derives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use time::macros::time;
use time::{OffsetDateTime, Time};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::Publisher;
use crate::schedule::{Clock, DailyWindow, PumpSlot, SlotTransition};
use crate::state::SharedState;
use crate::store::{RelayState, RelayTarget, Store};

/// Commands are events; the payload carries nothing.
const COMMAND_PAYLOAD: &[u8] = b"{}";

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub tick_interval: Duration,
    pub light_threshold: f64,
    pub light_window: DailyWindow,
    pub light_relay: RelayTarget,
    pub pump_relay: RelayTarget,
    /// Daily pump start times, one slot each.
    pub pump_schedule: Vec<Time>,
    pub pump_duration: Duration,
    /// How long after a slot's start time a tick may still start it.
    pub pump_start_grace: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            light_threshold: 500.0,
            light_window: DailyWindow::new(time!(8:00), time!(20:00)),
            light_relay: RelayTarget::new("esp32lr20", "relay1"),
            pump_relay: RelayTarget::new("esp32lr20", "relay2"),
            pump_schedule: vec![time!(9:00), time!(15:00)],
            pump_duration: Duration::from_secs(10 * 60),
            pump_start_grace: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Desired light command for one tick, if any.
///
/// Inside the window the light follows the intensity reading; outside it
/// the light is only ever switched off. With no reading or no reported
/// relay state nothing is commanded.
pub fn decide_light(
    now: Time,
    window: &DailyWindow,
    intensity: Option<f64>,
    threshold: f64,
    reported: Option<RelayState>,
) -> Option<RelayState> {
    let reported = reported?;

    if !window.contains(now) {
        return (reported == RelayState::On).then_some(RelayState::Off);
    }

    let intensity = intensity?;
    match reported {
        RelayState::On if intensity >= threshold => Some(RelayState::Off),
        RelayState::Off if intensity < threshold => Some(RelayState::On),
        _ => None,
    }
}

/// Desired pump command after every slot has been evaluated.
///
/// "off" is only sent once all slots are idle, so overlapping windows keep
/// the pump running until the last one clears.
fn decide_pump(
    started: bool,
    expired: bool,
    all_idle: bool,
    reported: Option<RelayState>,
) -> Option<RelayState> {
    match reported? {
        RelayState::Off if started => Some(RelayState::On),
        RelayState::On if expired && all_idle => Some(RelayState::Off),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A previous tick was still running; nothing was done.
    Skipped,
    /// The snapshot could not be read; nothing was decided.
    Aborted,
    Completed { issued: usize, failed: usize },
}

pub struct Controller<S: Store + ?Sized, P: Publisher + ?Sized, C: Clock> {
    store: Arc<S>,
    bus: Arc<P>,
    clock: C,
    opts: ControllerOptions,
    shared: SharedState,
    slots: Mutex<Vec<PumpSlot>>,
    in_flight: AtomicBool,
}

/// Releases the in-flight flag on every exit path.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S, P, C> Controller<S, P, C>
where
    S: Store + ?Sized + 'static,
    P: Publisher + ?Sized + 'static,
    C: Clock + 'static,
{
    pub fn new(
        store: Arc<S>,
        bus: Arc<P>,
        clock: C,
        opts: ControllerOptions,
        shared: SharedState,
    ) -> Self {
        let slots = opts
            .pump_schedule
            .iter()
            .map(|start| PumpSlot::new(*start, opts.pump_duration, opts.pump_start_grace))
            .collect();

        Self {
            store,
            bus,
            clock,
            opts,
            shared,
            slots: Mutex::new(slots),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Run one decision cycle. Never fails; problems are logged and shape
    /// the returned outcome.
    pub async fn tick(&self) -> TickOutcome {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            warn!("controller: previous tick still running, skipping");
            return TickOutcome::Skipped;
        };

        let now = self.clock.now();

        let snapshot = match self.store.read_snapshot().await {
            Ok(s) => s,
            Err(e) => {
                error!("controller: snapshot read failed, aborting tick: {e}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("controller: snapshot read failed ({e})"));
                return TickOutcome::Aborted;
            }
        };

        let mut commands: Vec<(&RelayTarget, RelayState)> = Vec::new();

        let light = decide_light(
            now.time(),
            &self.opts.light_window,
            snapshot.light_intensity,
            self.opts.light_threshold,
            snapshot.relay_state(&self.opts.light_relay),
        );
        if let Some(state) = light {
            debug!(
                intensity = ?snapshot.light_intensity,
                threshold = self.opts.light_threshold,
                %state,
                "controller: light decision"
            );
            commands.push((&self.opts.light_relay, state));
        }

        if let Some(state) = self
            .advance_pump(now, snapshot.relay_state(&self.opts.pump_relay))
            .await
        {
            commands.push((&self.opts.pump_relay, state));
        }

        let mut issued = 0;
        let mut failed = 0;
        for (target, state) in commands {
            let topic = target.command_topic(state);
            match self.bus.publish(&topic, COMMAND_PAYLOAD).await {
                Ok(()) => {
                    info!(relay = %target, %state, "controller: command issued");
                    issued += 1;
                }
                Err(e) => {
                    error!(relay = %target, %state, "controller: publish failed: {e}");
                    self.shared
                        .write()
                        .await
                        .record_error(format!("controller: {topic} not published ({e})"));
                    failed += 1;
                }
            }
        }

        self.shared.write().await.mark_tick(now);
        TickOutcome::Completed { issued, failed }
    }

    /// Evaluate every pump slot at `now` and return the pump command, if
    /// the slots' transitions call for one.
    async fn advance_pump(
        &self,
        now: OffsetDateTime,
        reported: Option<RelayState>,
    ) -> Option<RelayState> {
        let mut started = false;
        let mut expired = false;
        let mut notes = Vec::new();

        let all_idle = {
            let mut slots = self.slots.lock().await;
            for slot in slots.iter_mut() {
                match slot.evaluate(now) {
                    SlotTransition::Started { active_until } => {
                        started = true;
                        info!(
                            slot = %slot.start(),
                            until = %active_until,
                            "controller: pump slot started"
                        );
                        notes.push(format!("pump slot {} started", slot.start()));
                    }
                    SlotTransition::Expired => {
                        expired = true;
                        info!(slot = %slot.start(), "controller: pump slot finished");
                        notes.push(format!("pump slot {} finished", slot.start()));
                    }
                    SlotTransition::Running | SlotTransition::Idle => {}
                }
            }
            slots.iter().all(PumpSlot::is_idle)
        };

        if !notes.is_empty() {
            let mut st = self.shared.write().await;
            for note in notes {
                st.record_controller(note);
            }
        }

        if (started || expired) && reported.is_none() {
            warn!(
                relay = %self.opts.pump_relay,
                "controller: pump relay state unknown, no command"
            );
        }

        decide_pump(started, expired, all_idle, reported)
    }

    /// Start the periodic timer. The first tick runs immediately, then one
    /// every `tick_interval`. Each fire runs the tick as its own task, so a
    /// stalled tick never delays the timer; the in-flight guard drops the
    /// overlapping fire instead.
    pub fn start(self: Arc<Self>) -> ControllerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let period = self.opts.tick_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut ticks: Vec<JoinHandle<TickOutcome>> = Vec::new();

            info!(tick_sec = period.as_secs_f64(), "controller started");
            self.shared
                .write()
                .await
                .record_system("controller started".to_string());

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        ticks.retain(|t| !t.is_finished());
                        let this = Arc::clone(&self);
                        ticks.push(tokio::spawn(async move { this.tick().await }));
                    }
                    _ = stop_rx.changed() => break,
                }
            }

            // Let in-flight ticks finish; none are scheduled after this.
            for t in ticks {
                if let Err(e) = t.await {
                    error!("controller: tick task failed: {e}");
                }
            }
            info!("controller stopped");
        });

        ControllerHandle { stop_tx, task }
    }
}

pub struct ControllerHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    /// Cancel the timer and wait for any in-flight tick to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            error!("controller: timer task failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
