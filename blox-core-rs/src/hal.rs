//! Hardware abstraction for the role protocol
//!
//! The protocol needs very little from the board:
//! - Millisecond time and blocking waits
//! - A broadcast radio with a receive queue that can be gated
//! - The node's hardware id
//! - A program store and a way to reset
//!
//! # Implementing a HAL
//!
//! ```ignore
//! struct XBeeHal;
//!
//! impl Hal for XBeeHal {
//!     fn now_ms(&self) -> u32 {
//!         // Read SysTick millisecond counter
//!     }
//!
//!     fn send(&self, frame: &Envelope) -> Result<(), RadioError> {
//!         // Wrap in an XBee TX frame and clock it out the USART
//!     }
//!
//!     // ... implement other methods
//! }
//! ```
//!
//! The receive side is a queue filled from the radio interrupt. While
//! delivery is disabled, frames are dropped instead of queued, and disabling
//! also discards anything still waiting.

use crate::codec::Envelope;
use crate::error::RadioError;
use crate::types::{NodeId, ProgramName};

// ============================================================================
// HAL Trait
// ============================================================================

/// Board services the protocol runs on
pub trait Hal {
    /// Milliseconds since boot. Monotonic, wraps at `u32::MAX`.
    fn now_ms(&self) -> u32;

    /// Block for `ms` milliseconds
    fn wait_ms(&self, ms: u32);

    /// This node's hardware id
    fn local_id(&self) -> NodeId;

    /// Transmit one copy of a frame, best effort
    fn send(&self, frame: &Envelope) -> Result<(), RadioError>;

    /// Transmit a frame over and over for `duration_ms`.
    ///
    /// Each `send` takes the radio's airtime, which paces the copies. Failed
    /// copies do not end the window; the last failure is reported.
    fn send_for(&self, frame: &Envelope, duration_ms: u32) -> Result<(), RadioError> {
        let start = self.now_ms();
        let mut result = Ok(());
        while self.now_ms().wrapping_sub(start) < duration_ms {
            if let Err(e) = self.send(frame) {
                result = Err(e);
            }
        }
        result
    }

    /// Take the oldest queued frame, if any
    fn recv(&self) -> Option<Envelope>;

    /// Start queueing received frames
    fn enable_rx(&self);

    /// Stop queueing received frames and discard queued ones
    fn disable_rx(&self);

    /// Platform name
    fn platform_name(&self) -> &'static str;
}

/// Milliseconds from `now` until `deadline`, zero once it has passed
pub fn time_until(now: u32, deadline: u32) -> u32 {
    let left = deadline.wrapping_sub(now);
    if (left as i32) > 0 {
        left
    } else {
        0
    }
}

/// Stored program images
pub trait ProgramStore {
    /// Is an image with this name stored?
    fn has_program(&self, name: &str) -> bool;
}

/// Operations that end the current boot
pub trait Board {
    /// Warm reset. Volatile RAM, and with it the resume cell, survives.
    fn reset(&self) -> !;

    /// Load the named image and reset into it
    fn run_program(&self, name: &ProgramName) -> !;
}

// ============================================================================
// Receive Gate
// ============================================================================

/// RAII guard that holds receive delivery off
///
/// Handlers that block hold one of these, the way an interrupt handler
/// masks its own interrupt: copies of a frame still on air while we answer
/// it must not be answered again.
pub struct RxGate<'a, H: Hal + ?Sized> {
    hal: &'a H,
}

impl<'a, H: Hal + ?Sized> RxGate<'a, H> {
    /// Disable delivery until the guard drops
    pub fn new(hal: &'a H) -> Self {
        hal.disable_rx();
        Self { hal }
    }
}

impl<'a, H: Hal + ?Sized> Drop for RxGate<'a, H> {
    fn drop(&mut self) {
        self.hal.enable_rx();
    }
}

// ============================================================================
// Scripted HAL (virtual time, for tests)
// ============================================================================

#[cfg(any(test, feature = "sim"))]
pub mod scripted {
    //! Single-threaded HAL on a virtual clock.
    //!
    //! Time only moves when the protocol waits or transmits. Inbound frames
    //! are scheduled at absolute times, either up front or by responders that
    //! react to what the node under test sends.

    use super::*;
    use crate::codec::RoleMessage;
    use std::cell::{Cell, RefCell};

    type Responder = Box<dyn FnMut(u32, &Envelope) -> Vec<(u32, Envelope)>>;

    /// Virtual-time HAL
    pub struct ScriptedHal {
        id: NodeId,
        now: Cell<u32>,
        airtime_ms: u32,
        rx_enabled: Cell<bool>,
        pending: RefCell<Vec<(u32, Envelope)>>,
        sent: RefCell<Vec<(u32, Envelope)>>,
        responders: RefCell<Vec<Responder>>,
        fail_sends: Cell<bool>,
    }

    impl ScriptedHal {
        /// Node `id` at time zero, 10ms airtime, receive disabled
        pub fn new(id: NodeId) -> Self {
            Self {
                id,
                now: Cell::new(0),
                airtime_ms: 10,
                rx_enabled: Cell::new(false),
                pending: RefCell::new(Vec::new()),
                sent: RefCell::new(Vec::new()),
                responders: RefCell::new(Vec::new()),
                fail_sends: Cell::new(false),
            }
        }

        /// Set the time one transmission takes (at least 1ms)
        pub fn with_airtime(mut self, airtime_ms: u32) -> Self {
            self.airtime_ms = airtime_ms.max(1);
            self
        }

        /// Make every transmission fail
        pub fn fail_sends(&self, fail: bool) {
            self.fail_sends.set(fail);
        }

        /// Deliver `frame` at absolute time `at`
        pub fn deliver_at(&self, at: u32, frame: Envelope) {
            self.pending.borrow_mut().push((at, frame));
        }

        /// Deliver copies of `frame` every `every_ms` across `[from, until)`
        pub fn deliver_repeated(&self, from: u32, until: u32, every_ms: u32, frame: Envelope) {
            let mut at = from;
            while at < until {
                self.deliver_at(at, frame);
                at += every_ms.max(1);
            }
        }

        /// React to transmissions by scheduling inbound frames
        pub fn respond<F>(&self, responder: F)
        where
            F: FnMut(u32, &Envelope) -> Vec<(u32, Envelope)> + 'static,
        {
            self.responders.borrow_mut().push(Box::new(responder));
        }

        /// Everything transmitted so far, with send times
        pub fn sent(&self) -> Vec<(u32, Envelope)> {
            self.sent.borrow().clone()
        }

        /// Transmitted role messages as (time, destination, message)
        pub fn sent_messages(&self) -> Vec<(u32, NodeId, RoleMessage)> {
            self.sent
                .borrow()
                .iter()
                .filter_map(|(at, env)| RoleMessage::decode(env).ok().map(|m| (*at, env.dst, m)))
                .collect()
        }

        /// Is receive delivery enabled?
        pub fn rx_enabled(&self) -> bool {
            self.rx_enabled.get()
        }

        fn drop_due(&self) {
            let now = self.now.get();
            self.pending.borrow_mut().retain(|(at, _)| *at > now);
        }
    }

    impl Hal for ScriptedHal {
        fn now_ms(&self) -> u32 {
            self.now.get()
        }

        fn wait_ms(&self, ms: u32) {
            self.now.set(self.now.get().wrapping_add(ms));
        }

        fn local_id(&self) -> NodeId {
            self.id
        }

        fn send(&self, frame: &Envelope) -> Result<(), RadioError> {
            let now = self.now.get();
            self.wait_ms(self.airtime_ms);

            if self.fail_sends.get() {
                return Err(RadioError::Disconnected);
            }

            self.sent.borrow_mut().push((now, *frame));
            let replies: Vec<(u32, Envelope)> = self
                .responders
                .borrow_mut()
                .iter_mut()
                .flat_map(|r| r(now, frame))
                .collect();
            self.pending.borrow_mut().extend(replies);
            Ok(())
        }

        fn recv(&self) -> Option<Envelope> {
            if !self.rx_enabled.get() {
                return None;
            }
            let now = self.now.get();
            let mut pending = self.pending.borrow_mut();
            let next = pending
                .iter()
                .enumerate()
                .filter(|(_, (at, _))| *at <= now)
                .min_by_key(|(_, (at, _))| *at)
                .map(|(i, _)| i)?;
            Some(pending.remove(next).1)
        }

        fn enable_rx(&self) {
            self.drop_due();
            self.rx_enabled.set(true);
        }

        fn disable_rx(&self) {
            self.drop_due();
            self.rx_enabled.set(false);
        }

        fn platform_name(&self) -> &'static str {
            "scripted"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedHal;
    use super::*;
    use crate::codec::RoleMessage;

    #[test]
    fn test_time_until() {
        assert_eq!(time_until(100, 150), 50);
        assert_eq!(time_until(150, 150), 0);
        assert_eq!(time_until(200, 150), 0);
        assert_eq!(time_until(u32::MAX - 5, 10), 16);
    }

    #[test]
    fn test_send_for_repeats_for_window() {
        let hal = ScriptedHal::new(1).with_airtime(10);
        let frame = RoleMessage::ProgAck.to_envelope(1, 2);

        hal.send_for(&frame, 100).unwrap();

        assert_eq!(hal.sent().len(), 10);
        assert_eq!(hal.now_ms(), 100);
    }

    #[test]
    fn test_send_for_reports_failures() {
        let hal = ScriptedHal::new(1);
        hal.fail_sends(true);
        let frame = RoleMessage::ProgAck.to_envelope(1, 2);

        assert_eq!(hal.send_for(&frame, 30), Err(RadioError::Disconnected));
        assert!(hal.sent().is_empty());
    }

    #[test]
    fn test_rx_gate_drops_frames() {
        let hal = ScriptedHal::new(1);
        hal.enable_rx();
        hal.deliver_at(5, RoleMessage::ProgAck.to_envelope(2, 1));
        hal.deliver_at(50, RoleMessage::ProgAck.to_envelope(3, 1));

        {
            let _gate = RxGate::new(&hal);
            assert!(!hal.rx_enabled());
            hal.wait_ms(20);
            assert!(hal.recv().is_none());
        }

        assert!(hal.rx_enabled());
        assert!(hal.recv().is_none());
        hal.wait_ms(40);
        assert_eq!(hal.recv().map(|e| e.src), Some(3));
    }
}
