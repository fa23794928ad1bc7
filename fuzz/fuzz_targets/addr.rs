//! Fuzz test for address and peer id parsing

#![no_main]

use flare_crypto::PeerId;
use flare_proto::{AddrInfo, PeerAddr};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = PeerId::from_bytes(data);

    if let Ok(addr) = PeerAddr::from_bytes(data) {
        let _ = addr.is_relayed();
        let _ = addr.socket_addr();
        assert_eq!(PeerAddr::from_bytes(&addr.to_bytes()).unwrap(), addr);
    }

    if let Ok(s) = std::str::from_utf8(data) {
        let _ = s.parse::<PeerId>();
        if let Ok(info) = s.parse::<AddrInfo>() {
            assert_eq!(info.to_string().parse::<AddrInfo>().unwrap(), info);
        }
    }
});
