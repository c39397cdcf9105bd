#![no_main]

use libfuzzer_sys::fuzz_target;
use matchlink_client::machine::{MachineConfig, SessionMachine};
use matchlink_client::protocol::InboundEvent;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Parsing is lenient: anything that is an envelope must be accepted.
    let Ok(event) = InboundEvent::from_json(text) else {
        return;
    };

    // Whatever the payload held, applying it to a live session must not panic.
    let mut machine = SessionMachine::new(MachineConfig::default());
    machine.set_connection(true, Some("fuzz".to_owned()));
    machine.handle(InboundEvent::ParticipantCreated);
    if machine.request_match(0).is_ok() {
        let _ = machine.handle(event.clone());
        let _ = machine.handle(event);
    }
});
