use std::cell::Cell;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use indexmap::IndexMap;

use tracing::{debug, error, info, warn};

use crate::countdown::{CountdownSlot, spawn_countdown};
use crate::error::{Error, ErrorKind, Result};
use crate::processor::{AvailabilityProcessor, Verdict, VirtualDeviceProcessor};
use crate::value::{Availability, ButtonAction, DeviceKind, Property, Value};

// Maximum number of nested observer notifications on a thread.
const MAX_NOTIFY_DEPTH: usize = 16;

thread_local! {
    static NOTIFY_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct NotifyGuard;

impl NotifyGuard {
    fn enter() -> Option<Self> {
        NOTIFY_DEPTH.with(|depth| {
            let current = depth.get();
            (current < MAX_NOTIFY_DEPTH).then(|| {
                depth.set(current + 1);
                Self
            })
        })
    }
}

impl Drop for NotifyGuard {
    fn drop(&mut self) {
        NOTIFY_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publishes commands for the virtual devices it owns.
///
/// A [`crate::bridge::Bridge`] is the command sink of the virtual devices
/// bound to its codec.
pub trait CommandSink: Send + Sync {
    /// Encodes and publishes a command setting `property` to `value`.
    ///
    /// # Errors
    ///
    /// Fails when the property cannot be commanded or when the command
    /// cannot be published.
    fn publish_command(&self, property: Property, value: Value) -> Result<()>;
}

/// The outcome of [`VirtualDevice::apply_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update has been stored and notified.
    Notified,
    /// The update repeats the stored value and the device is in quiet mode,
    /// so nothing has been notified.
    Echo,
}

#[derive(Default)]
struct State {
    values: IndexMap<Property, Value>,
    availability: Availability,
    countdown: CountdownSlot,
    pending: Option<Value>,
}

impl State {
    fn is_active(&self, property: Property) -> bool {
        self.values
            .get(&property)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// A canonical device.
///
/// A virtual device holds the latest value of each of its properties and
/// forwards every update to its processors and then to its observers.
///
/// Operable devices, switches and alarms, can be started and stopped.
/// A device configured with a countdown reverts to stopped once the
/// countdown has elapsed since it was last started.
pub struct VirtualDevice {
    friendly_name: String,
    kind: DeviceKind,
    quiet_mode: bool,
    countdown: Option<Duration>,
    long_countdown: Option<Duration>,
    state: Mutex<State>,
    processors: Mutex<Vec<Arc<dyn VirtualDeviceProcessor>>>,
    availability_processors: Mutex<Vec<Arc<dyn AvailabilityProcessor>>>,
    observers: Mutex<Vec<Weak<VirtualDevice>>>,
    sink: OnceLock<Weak<dyn CommandSink>>,
    // Held while a command is checked against the state and published.
    command: Mutex<()>,
}

impl std::fmt::Debug for VirtualDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDevice")
            .field("friendly_name", &self.friendly_name)
            .field("kind", &self.kind)
            .field("quiet_mode", &self.quiet_mode)
            .field("countdown", &self.countdown)
            .field("long_countdown", &self.long_countdown)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for VirtualDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self.kind, self.friendly_name)
    }
}

impl VirtualDevice {
    /// Creates a [`VirtualDevice`].
    pub fn new(kind: DeviceKind, friendly_name: impl Into<String>) -> Self {
        Self {
            friendly_name: friendly_name.into(),
            kind,
            quiet_mode: false,
            countdown: None,
            long_countdown: None,
            state: Mutex::new(State::default()),
            processors: Mutex::new(Vec::new()),
            availability_processors: Mutex::new(Vec::new()),
            observers: Mutex::new(Vec::new()),
            sink: OnceLock::new(),
            command: Mutex::new(()),
        }
    }

    /// Suppresses notifications of updates which repeat the stored value.
    #[must_use]
    pub const fn quiet_mode(mut self, quiet_mode: bool) -> Self {
        self.quiet_mode = quiet_mode;
        self
    }

    /// Sets the countdown after which a started device reverts to stopped.
    #[must_use]
    pub const fn countdown(mut self, countdown: Duration) -> Self {
        self.countdown = Some(countdown);
        self
    }

    /// Sets the countdown used when a double press starts the device.
    #[must_use]
    pub const fn long_countdown(mut self, long_countdown: Duration) -> Self {
        self.long_countdown = Some(long_countdown);
        self
    }

    /// Returns the friendly name.
    #[must_use]
    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    /// Returns the [`DeviceKind`].
    #[must_use]
    pub const fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Returns the primary [`Property`].
    #[must_use]
    pub const fn property(&self) -> Property {
        self.kind.property()
    }

    /// Returns the latest value of the primary property.
    #[must_use]
    pub fn value(&self) -> Option<Value> {
        self.value_of(self.kind.property())
    }

    /// Returns the latest value of `property`.
    #[must_use]
    pub fn value_of(&self, property: Property) -> Option<Value> {
        lock(&self.state).values.get(&property).copied()
    }

    /// Whether the primary property is `true`.
    #[must_use]
    pub fn is_active(&self) -> bool {
        lock(&self.state).is_active(self.kind.property())
    }

    /// Returns the current [`Availability`].
    #[must_use]
    pub fn availability(&self) -> Availability {
        lock(&self.state).availability
    }

    /// Whether a countdown is pending.
    #[must_use]
    pub fn is_countdown_armed(&self) -> bool {
        lock(&self.state).countdown.is_armed()
    }

    /// Whether a reverting command is waiting to be published.
    #[must_use]
    pub fn has_pending_command(&self) -> bool {
        lock(&self.state).pending.is_some()
    }

    /// Appends a value processor.
    ///
    /// Processors run in insertion order.
    pub fn processor_append(&self, processor: Arc<dyn VirtualDeviceProcessor>) {
        lock(&self.processors).push(processor);
    }

    /// Appends an availability processor.
    pub fn availability_processor_append(&self, processor: Arc<dyn AvailabilityProcessor>) {
        lock(&self.availability_processors).push(processor);
    }

    /// Registers `observer` to react to the updates of this device.
    ///
    /// The device holds a weak reference, so the observer is dropped from
    /// the list once it is no longer owned elsewhere.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::UnsupportedOperation`] when `observer` is
    /// not operable or is this device.
    pub fn add_observer(&self, observer: &Arc<VirtualDevice>) -> Result<()> {
        if !observer.kind.is_operable() {
            return Err(Error::unsupported(format!(
                "{observer} cannot react to updates, it cannot observe {self}"
            )));
        }
        if std::ptr::eq(self, Arc::as_ptr(observer)) {
            return Err(Error::unsupported(format!("{self} cannot observe itself")));
        }
        lock(&self.observers).push(Arc::downgrade(observer));
        Ok(())
    }

    /// Returns the live observers.
    #[must_use]
    pub fn observers(&self) -> Vec<Arc<VirtualDevice>> {
        let mut observers = lock(&self.observers);
        observers.retain(|observer| observer.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    /// Whether the device publishes its commands through a bridge.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.sink.get().is_some()
    }

    pub(crate) fn bind(&self, sink: Weak<dyn CommandSink>) -> Result<()> {
        self.sink
            .set(sink)
            .map_err(|_| Error::binding(format!("{self} is already bound to a bridge")))
    }

    /// Stores an update and notifies it.
    ///
    /// The value is checked against the property kind, floats are rounded to
    /// one decimal. Processors run in insertion order: a failing processor
    /// is logged and the chain goes on. Unless a processor suppresses it,
    /// the update is then forwarded to every observer.
    ///
    /// For an operable device, an update of its primary property also
    /// drives the countdown: `true` arms it when none is pending, `false`
    /// cancels it.
    ///
    /// # Errors
    ///
    /// Fails when the value does not match the property kind.
    pub fn apply_update(self: &Arc<Self>, property: Property, value: Value) -> Result<UpdateOutcome> {
        let value = value.conform_to(property)?;

        let echo = {
            let mut state = lock(&self.state);
            let echo = state.values.get(&property) == Some(&value);
            let _ = state.values.insert(property, value);

            if self.kind.is_operable() && property == self.kind.property() {
                self.follow_reported_state(&mut state, value);
            }
            echo
        };

        if echo && self.quiet_mode {
            debug!("{self} repeats {property} = {value}, update not notified");
            return Ok(UpdateOutcome::Echo);
        }

        self.notify(property, value);
        Ok(UpdateOutcome::Notified)
    }

    /// Sets the availability and runs the availability processors when it
    /// changes.
    ///
    /// Returns whether the availability has changed.
    pub fn set_availability(&self, availability: Availability) -> bool {
        {
            let mut state = lock(&self.state);
            if state.availability == availability {
                return false;
            }
            state.availability = availability;
        }

        let processors = lock(&self.availability_processors).clone();
        for processor in processors {
            if let Err(e) = processor.process_availability_update(&self.friendly_name, availability)
            {
                error!("Availability processor of {self} failed: {e}");
            }
        }
        true
    }

    /// Starts the device.
    ///
    /// An inactive device is set active locally, notified, and commanded
    /// through its bridge. An active device only has its countdown re-armed.
    ///
    /// # Errors
    ///
    /// Fails when the device is not operable or when the command cannot be
    /// published. The local state is updated in both cases.
    pub fn trigger_start(self: &Arc<Self>) -> Result<()> {
        self.start(self.countdown)
    }

    /// Starts the device and stops it after `period`.
    ///
    /// # Errors
    ///
    /// Same as [`VirtualDevice::trigger_start`].
    pub fn start_and_stop(self: &Arc<Self>, period: Duration) -> Result<()> {
        self.start(Some(period))
    }

    /// Stops the device.
    ///
    /// Any pending countdown is cancelled. An active device is set inactive
    /// locally, notified, and commanded through its bridge. Stopping an
    /// inactive device does nothing else.
    ///
    /// # Errors
    ///
    /// Fails when the device is not operable or when the command cannot be
    /// published.
    pub fn trigger_stop(self: &Arc<Self>) -> Result<()> {
        self.ensure_operable()?;
        let property = self.kind.property();

        let was_active = {
            let mut state = lock(&self.state);
            let _ = state.countdown.disarm();
            state.pending = None;
            let was_active = state.is_active(property);
            if was_active {
                let _ = state.values.insert(property, Value::Bool(false));
            }
            was_active
        };

        if !was_active {
            debug!("{self} is already stopped");
            return Ok(());
        }

        self.notify(property, Value::Bool(false));
        self.send(property, Value::Bool(false))
    }

    /// Reacts to an update notified by an observed device.
    ///
    /// Only operable devices react, other devices cannot be registered as
    /// observers:
    ///
    /// - occupancy `true` and single press start the device
    /// - double press starts the device for the long countdown, if any
    /// - long press stops the device
    pub fn notify_from(self: &Arc<Self>, source: &VirtualDevice, property: Property, value: Value) {
        if !self.kind.is_operable() {
            debug!("{self} ignores {property} = {value} from {source}");
            return;
        }

        let result = match (property, value) {
            (Property::Occupancy, Value::Bool(true))
            | (Property::Action, Value::Action(ButtonAction::Single)) => self.trigger_start(),
            (Property::Action, Value::Action(ButtonAction::Double)) => match self.long_countdown {
                Some(period) => self.start_and_stop(period),
                None => self.trigger_start(),
            },
            (Property::Action, Value::Action(ButtonAction::Long)) => self.trigger_stop(),
            _ => {
                debug!("{self} has no reaction to {property} = {value} from {source}");
                return;
            }
        };

        if let Err(e) = result {
            error!("{self} failed to react to {property} = {value} from {source}: {e}");
        }
    }

    // Publishes the reverting command left behind by a failed countdown.
    //
    // The command is attempted once and then dropped.
    pub(crate) fn retry_pending_command(&self) {
        let Some(value) = lock(&self.state).pending.take() else {
            return;
        };

        match self.send(self.kind.property(), value) {
            Ok(()) => info!("{self} published the pending {} = {value}", self.kind.property()),
            Err(e) => warn!("{self} dropped the pending {} = {value}: {e}", self.kind.property()),
        }
    }

    fn start(self: &Arc<Self>, period: Option<Duration>) -> Result<()> {
        self.ensure_operable()?;
        let property = self.kind.property();

        let was_active = {
            let mut state = lock(&self.state);
            state.pending = None;
            let was_active = state.is_active(property);
            if !was_active {
                let _ = state.values.insert(property, Value::Bool(true));
            }
            if let Some(period) = period {
                self.arm(&mut state, period);
            }
            was_active
        };

        if was_active {
            debug!("{self} is already started");
            return Ok(());
        }

        self.notify(property, Value::Bool(true));
        self.send(property, Value::Bool(true))
    }

    fn ensure_operable(&self) -> Result<()> {
        if self.kind.is_operable() {
            Ok(())
        } else {
            Err(Error::unsupported(format!("{self} cannot be started or stopped")))
        }
    }

    fn follow_reported_state(self: &Arc<Self>, state: &mut State, value: Value) {
        match value.as_bool() {
            Some(true) => {
                if let Some(period) = self.countdown
                    && !state.countdown.is_armed()
                {
                    self.arm(state, period);
                }
            }
            Some(false) => {
                let _ = state.countdown.disarm();
                state.pending = None;
            }
            None => {}
        }
    }

    fn arm(self: &Arc<Self>, state: &mut State, period: Duration) {
        let (generation, token) = state.countdown.rearm();
        let device = Arc::downgrade(self);
        let armed = spawn_countdown(token, period, move || {
            if let Some(device) = device.upgrade() {
                device.countdown_elapsed(generation);
            }
        });
        if !armed {
            let _ = state.countdown.disarm();
        }
    }

    fn countdown_elapsed(self: &Arc<Self>, generation: u64) {
        let property = self.kind.property();

        let was_active = {
            let mut state = lock(&self.state);
            if !state.countdown.expire(generation) {
                return;
            }
            let was_active = state.is_active(property);
            if was_active {
                let _ = state.values.insert(property, Value::Bool(false));
            }
            was_active
        };

        if !was_active {
            return;
        }

        info!("{self} countdown elapsed, stopping");
        self.notify(property, Value::Bool(false));

        if let Err(e) = self.send(property, Value::Bool(false)) {
            if e.kind() == ErrorKind::PublishFailure {
                let mut state = lock(&self.state);
                if state.is_active(property) {
                    debug!("{self} was restarted, stop command dropped: {e}");
                } else {
                    warn!("{self} cannot publish the stop command, retrying on reconnection: {e}");
                    state.pending = Some(Value::Bool(false));
                }
            } else {
                error!("{self} cannot stop: {e}");
            }
        }
    }

    // Publishes `value` unless a later transition has replaced it.
    //
    // Commands of a device are published one at a time, after the
    // check, so the last published command follows the local state.
    fn send(&self, property: Property, value: Value) -> Result<()> {
        let _command = lock(&self.command);
        if lock(&self.state).values.get(&property) != Some(&value) {
            debug!("{self} has changed since {property} = {value}, command dropped");
            return Ok(());
        }

        let Some(sink) = self.sink.get().and_then(Weak::upgrade) else {
            if self.sink.get().is_some() {
                warn!("{self} lost its bridge, {property} = {value} is local only");
            } else {
                debug!("{self} is not bound to a bridge, {property} = {value} is local only");
            }
            return Ok(());
        };
        sink.publish_command(property, value)
    }

    fn notify(self: &Arc<Self>, property: Property, value: Value) {
        let Some(_guard) = NotifyGuard::enter() else {
            error!("{self} exceeds {MAX_NOTIFY_DEPTH} nested notifications, observers form a cycle");
            return;
        };

        let processors = lock(&self.processors).clone();
        let mut forwarded = Some(value);
        for processor in processors {
            match processor.process_value_update(self, property, value) {
                Ok(Verdict::Pass) => {}
                Ok(Verdict::Replace(replacement)) => {
                    if forwarded.is_some() {
                        forwarded = Some(replacement);
                    }
                }
                Ok(Verdict::Suppress) => forwarded = None,
                Err(e) => error!("Processor of {self} failed on {property} = {value}: {e}"),
            }
        }

        let Some(forwarded) = forwarded else {
            debug!("{property} = {value} of {self} suppressed by a processor");
            return;
        };

        for observer in self.observers() {
            observer.notify_from(self, property, forwarded);
        }
    }
}
