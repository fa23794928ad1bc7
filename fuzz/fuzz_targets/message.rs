//! Fuzz test for presence message decoding
//!
//! Arbitrary frame bodies must decode to an error or to a message whose
//! peer records either convert cleanly or are rejected, never panic.

#![no_main]

use flare_proto::{FlareMessage, PresenceRecord};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(msg) = FlareMessage::from_bytes(data) else {
        return;
    };

    match msg {
        FlareMessage::Announce { peer_info, .. } => {
            let _ = PresenceRecord::try_from(peer_info);
        }
        FlareMessage::PeerList { peers } => {
            for info in peers {
                let _ = PresenceRecord::try_from(info);
            }
        }
        _ => {}
    }

    // Anything that decoded must encode again
    let Ok(msg) = FlareMessage::from_bytes(data) else {
        return;
    };
    let encoded = msg.to_bytes().unwrap();
    assert_eq!(FlareMessage::from_bytes(&encoded).unwrap(), msg);
});
