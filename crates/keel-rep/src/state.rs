//! Per-handle replication state and change notification.
//!
//! ```text
//!              join                         close
//!   UNKNOWN ─────────► MASTER | REPLICA ─────────► DETACHED
//!      ▲                      │
//!      └──── failure ─────────┘
//! ```
//!
//! Every transition is delivered, in order, to the registered
//! [`StateChangeListener`] and to every live [`Subscription`]. Dispatch for a
//! handle is serialized: a transition does not return until its event has
//! been handed to every observer, and no two dispatches overlap.
//!
//! A listener that fails is removed and its error is returned from the
//! transition; the owning node treats that as fatal and invalidates itself.

use std::fmt;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use keel_types::{NodeName, NodeState};
use tracing::{info, warn};

use crate::{RepError, RepResult};

// ============================================================================
// Events and Listeners
// ============================================================================

/// One observed state of a node handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChangeEvent {
    /// The new state.
    pub state: NodeState,
    /// The master known at the time, if any.
    pub master: Option<NodeName>,
    /// Position of the event in this handle's history, starting at 0.
    pub ordinal: u64,
}

impl fmt::Display for StateChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.master {
            Some(master) => write!(f, "#{} {} (master {master})", self.ordinal, self.state),
            None => write!(f, "#{} {}", self.ordinal, self.state),
        }
    }
}

/// Error returned by a failing listener.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ListenerError {
    message: String,
}

impl ListenerError {
    /// Creates a listener error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Receives state changes of a node handle.
///
/// Listeners run on the thread performing the transition and must not call
/// back into the node that owns them.
pub trait StateChangeListener: Send {
    /// Called once at registration with the current state, then once per
    /// transition.
    fn state_changed(&mut self, event: &StateChangeEvent) -> Result<(), ListenerError>;
}

impl<F> StateChangeListener for F
where
    F: FnMut(&StateChangeEvent) -> Result<(), ListenerError> + Send,
{
    fn state_changed(&mut self, event: &StateChangeEvent) -> Result<(), ListenerError> {
        self(event)
    }
}

/// A bounded queue of state change events.
///
/// Dropping the subscription cancels it. A subscriber that falls a full
/// queue behind is disconnected rather than silently skipping events.
#[derive(Debug)]
pub struct Subscription {
    rx: Receiver<StateChangeEvent>,
}

impl Subscription {
    /// Waits up to `timeout` for the next event.
    ///
    /// Returns `None` on timeout or once the subscription was disconnected.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<StateChangeEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Returns the next event if one is queued.
    pub fn try_recv(&self) -> Option<StateChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Drains every queued event.
    pub fn drain(&self) -> Vec<StateChangeEvent> {
        self.rx.try_iter().collect()
    }
}

// ============================================================================
// State Machine
// ============================================================================

#[derive(Debug)]
struct Current {
    state: NodeState,
    master: Option<NodeName>,
    ordinal: u64,
}

impl Current {
    fn event(&self) -> StateChangeEvent {
        StateChangeEvent {
            state: self.state,
            master: self.master.clone(),
            ordinal: self.ordinal,
        }
    }
}

#[derive(Default)]
struct Dispatch {
    listener: Option<Box<dyn StateChangeListener>>,
    subscribers: Vec<SyncSender<StateChangeEvent>>,
}

impl Dispatch {
    fn publish(&mut self, event: &StateChangeEvent) -> Result<(), ListenerError> {
        self.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Disconnected(_)) => false,
            Err(TrySendError::Full(_)) => {
                warn!(event = %event, "subscriber lagged, disconnecting");
                false
            }
        });

        if let Some(listener) = self.listener.as_mut() {
            if let Err(e) = listener.state_changed(event) {
                self.listener = None;
                return Err(e);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("listener", &self.listener.is_some())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

/// The replication state of one node handle.
#[derive(Debug)]
pub struct NodeStateMachine {
    node: NodeName,
    // Lock order: dispatch, then current.
    dispatch: Mutex<Dispatch>,
    current: Mutex<Current>,
    changed: Condvar,
}

impl NodeStateMachine {
    /// Creates a state machine in [`NodeState::Unknown`].
    pub fn new(node: NodeName) -> Self {
        Self {
            node,
            dispatch: Mutex::new(Dispatch::default()),
            current: Mutex::new(Current {
                state: NodeState::Unknown,
                master: None,
                ordinal: 0,
            }),
            changed: Condvar::new(),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> NodeState {
        self.current.lock().expect("lock poisoned").state
    }

    /// Returns the master known to this handle.
    pub fn master(&self) -> Option<NodeName> {
        self.current.lock().expect("lock poisoned").master.clone()
    }

    /// Returns the latest event.
    pub fn current(&self) -> StateChangeEvent {
        self.current.lock().expect("lock poisoned").event()
    }

    /// Moves to `to` and notifies every observer.
    ///
    /// # Errors
    ///
    /// - [`RepError::InvalidTransition`] if the move is not allowed; nothing changes
    /// - [`RepError::Listener`] if the listener failed; the transition has
    ///   happened and the listener was removed
    pub fn transition(
        &self,
        to: NodeState,
        master: Option<NodeName>,
    ) -> RepResult<StateChangeEvent> {
        let mut dispatch = self.dispatch.lock().expect("lock poisoned");
        let event = {
            let mut current = self.current.lock().expect("lock poisoned");
            if !current.state.can_transition_to(to) {
                return Err(RepError::InvalidTransition {
                    from: current.state,
                    to,
                });
            }
            current.state = to;
            current.master = master;
            current.ordinal += 1;
            current.event()
        };
        self.changed.notify_all();
        info!(node = %self.node, event = %event, "state changed");

        dispatch.publish(&event).map_err(|e| {
            warn!(node = %self.node, error = %e, "state change listener failed");
            RepError::Listener(e)
        })?;
        Ok(event)
    }

    /// Installs `listener`, replacing any previous one.
    ///
    /// The listener is called immediately with the current state. If that
    /// call fails the listener is not installed and the error is returned.
    pub fn set_listener(&self, mut listener: Box<dyn StateChangeListener>) -> RepResult<()> {
        let mut dispatch = self.dispatch.lock().expect("lock poisoned");
        let event = self.current();
        dispatch.listener = None;
        listener.state_changed(&event)?;
        dispatch.listener = Some(listener);
        Ok(())
    }

    /// Removes the listener.
    pub fn clear_listener(&self) {
        self.dispatch.lock().expect("lock poisoned").listener = None;
    }

    /// Opens a subscription holding up to `capacity` events. The current
    /// state is queued first.
    pub fn subscribe(&self, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let mut dispatch = self.dispatch.lock().expect("lock poisoned");
        // The queue is empty and at least one slot large.
        let _ = tx.try_send(self.current());
        dispatch.subscribers.push(tx);
        Subscription { rx }
    }

    /// Blocks until the state satisfies `accept` or the timeout elapses.
    pub fn await_state<F>(&self, timeout: Duration, mut accept: F) -> Option<StateChangeEvent>
    where
        F: FnMut(NodeState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut current = self.current.lock().expect("lock poisoned");
        loop {
            if accept(current.state) {
                return Some(current.event());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(current, deadline - now)
                .expect("lock poisoned");
            current = guard;
        }
    }
}
