//! Base program side of the role protocol
//!
//! Every Blox idles in its base program until asked to run something. For
//! role negotiation the base program only has two jobs: tell a parent that
//! it holds a program image, and start that image when the parent says so.

use tracing::{debug, info, trace, warn};

use crate::codec::{Envelope, RoleMessage};
use crate::config::ProtocolConfig;
use crate::hal::{time_until, Board, Hal, ProgramStore, RxGate};
use crate::types::{NodeId, ProgramName};

/// Answers program queries on behalf of the program store
pub struct BaseListener<'a, H: Hal, S: ProgramStore + ?Sized> {
    hal: &'a H,
    store: &'a S,
    config: ProtocolConfig,
}

impl<'a, H: Hal, S: ProgramStore + ?Sized> BaseListener<'a, H, S> {
    /// Create a listener and start receiving
    pub fn new(hal: &'a H, store: &'a S, config: ProtocolConfig) -> Self {
        hal.enable_rx();
        debug!("Base: listening on {:#010x}", hal.local_id());
        Self { hal, store, config }
    }

    /// Handle queued frames until `deadline`.
    ///
    /// Returns the name of a program a parent asked us to start.
    pub fn poll(&mut self, deadline: u32) -> Option<ProgramName> {
        loop {
            while let Some(frame) = self.hal.recv() {
                if let Some(name) = self.handle(&frame) {
                    return Some(name);
                }
            }
            let left = time_until(self.hal.now_ms(), deadline);
            if left == 0 {
                return None;
            }
            self.hal.wait_ms(left.min(self.config.poll_interval_ms));
        }
    }

    /// Run as the base program until a parent starts something
    pub fn serve<B: Board + ?Sized>(mut self, board: &B) -> ! {
        loop {
            let deadline = self.hal.now_ms().wrapping_add(self.config.hold_period_ms);
            if let Some(name) = self.poll(deadline) {
                board.run_program(&name);
            }
        }
    }

    /// Process one received frame
    pub fn handle(&mut self, frame: &Envelope) -> Option<ProgramName> {
        let message = match RoleMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                trace!("Base: dropping frame from {:#010x}: {}", frame.src, e);
                return None;
            }
        };
        if !frame.is_for(self.hal.local_id()) {
            return None;
        }

        match message {
            RoleMessage::ProgQuery { name } => {
                self.on_prog_query(frame.src, &name);
                None
            }
            RoleMessage::ProgStart { name } => self.on_prog_start(frame.src, name),
            other => {
                trace!(
                    "Base: ignoring {:?} from {:#010x}",
                    other.opcode(),
                    frame.src
                );
                None
            }
        }
    }

    fn on_prog_query(&self, src: NodeId, name: &str) {
        if !self.store.has_program(name) {
            debug!("Base: no image of '{}' for {:#010x}", name, src);
            return;
        }

        let hal = self.hal;
        let _gate = RxGate::new(hal);
        // The parent is still transmitting its query
        hal.wait_ms(self.config.hold_period_ms);

        info!("Base: have '{}', answering {:#010x}", name, src);
        let ack = RoleMessage::ProgAck.to_envelope(hal.local_id(), src);
        if let Err(e) = hal.send_for(&ack, self.config.hold_period_ms) {
            warn!("Base: ProgAck to {:#010x} failed: {}", src, e);
        }
    }

    fn on_prog_start(&self, src: NodeId, name: ProgramName) -> Option<ProgramName> {
        let hal = self.hal;
        let _gate = RxGate::new(hal);
        // Let the parent finish its ProgStart window
        hal.wait_ms(self.config.hold_period_ms);

        if self.store.has_program(&name) {
            info!("Base: {:#010x} started '{}'", src, name);
            Some(name)
        } else {
            warn!("Base: asked to start '{}' but no image is stored", name);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::scripted::ScriptedHal;
    use crate::types::{program_name, BROADCAST_ID};

    const HOLD: u32 = 100;

    struct Store(&'static [&'static str]);

    impl ProgramStore for Store {
        fn has_program(&self, name: &str) -> bool {
            self.0.iter().any(|stored| *stored == name)
        }
    }

    struct PanicBoard;

    impl Board for PanicBoard {
        fn reset(&self) -> ! {
            panic!("reset");
        }

        fn run_program(&self, name: &ProgramName) -> ! {
            panic!("run_program {}", name);
        }
    }

    fn prog_query(name: &str) -> Envelope {
        RoleMessage::ProgQuery {
            name: program_name(name).unwrap(),
        }
        .to_envelope(1, BROADCAST_ID)
    }

    fn prog_start(name: &str, dst: NodeId) -> Envelope {
        RoleMessage::ProgStart {
            name: program_name(name).unwrap(),
        }
        .to_envelope(1, dst)
    }

    #[test]
    fn test_answers_query_for_stored_program() {
        let hal = ScriptedHal::new(2);
        let store = Store(&["role_test"]);
        let mut base = BaseListener::new(&hal, &store, ProtocolConfig::with_hold_period(HOLD));

        hal.deliver_at(5, prog_query("role_test"));
        assert_eq!(base.poll(50), None);

        let sent = hal.sent_messages();
        assert_eq!(sent.len(), 10);
        assert_eq!(sent[0].0, 5 + HOLD);
        assert!(sent
            .iter()
            .all(|(_, dst, m)| *dst == 1 && *m == RoleMessage::ProgAck));
        assert!(hal.rx_enabled());
    }

    #[test]
    fn test_ignores_query_for_missing_program() {
        let hal = ScriptedHal::new(2);
        let store = Store(&["role_test"]);
        let mut base = BaseListener::new(&hal, &store, ProtocolConfig::with_hold_period(HOLD));

        hal.deliver_at(5, prog_query("other"));
        assert_eq!(base.poll(50), None);
        assert!(hal.sent().is_empty());
        assert_eq!(hal.now_ms(), 50);
    }

    #[test]
    fn test_start_after_hold() {
        let hal = ScriptedHal::new(2);
        let store = Store(&["role_test"]);
        let mut base = BaseListener::new(&hal, &store, ProtocolConfig::with_hold_period(HOLD));

        // Redundant copies that arrive while waiting are dropped
        hal.deliver_repeated(5, 60, 10, prog_start("role_test", 2));
        assert_eq!(base.poll(1000), Some(program_name("role_test").unwrap()));
        assert_eq!(hal.now_ms(), 5 + HOLD);
        assert_eq!(base.poll(hal.now_ms() + 10), None);
    }

    #[test]
    fn test_start_addressed_elsewhere_is_ignored() {
        let hal = ScriptedHal::new(2);
        let store = Store(&["role_test"]);
        let mut base = BaseListener::new(&hal, &store, ProtocolConfig::with_hold_period(HOLD));

        hal.deliver_at(5, prog_start("role_test", 3));
        assert_eq!(base.poll(50), None);
    }

    #[test]
    fn test_start_for_missing_program() {
        let hal = ScriptedHal::new(2);
        let store = Store(&[]);
        let mut base = BaseListener::new(&hal, &store, ProtocolConfig::with_hold_period(HOLD));

        hal.deliver_at(5, prog_start("role_test", 2));
        assert_eq!(base.poll(500), None);
        assert_eq!(hal.now_ms(), 500);
    }

    #[test]
    #[should_panic(expected = "run_program role_test")]
    fn test_serve_runs_started_program() {
        let hal = ScriptedHal::new(2);
        let store = Store(&["role_test"]);
        let base = BaseListener::new(&hal, &store, ProtocolConfig::with_hold_period(HOLD));

        hal.deliver_at(250, prog_start("role_test", BROADCAST_ID));
        base.serve(&PanicBoard);
    }
}
