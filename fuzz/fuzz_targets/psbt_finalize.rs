#![no_main]

use libfuzzer_sys::fuzz_target;
use nostring_vault_core::api;

fuzz_target!(|data: &[u8]| {
    // Signed payloads come from outside devices; finalize must never panic.
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = api::finalize_psbt(s);
        let _ = api::prepare_broadcast(s, "testnet");
    }
});
