#![no_main]

use libfuzzer_sys::fuzz_target;
use nostring_vault_core::api;
use nostring_vault_core::backup::VaultBackup;

fuzz_target!(|data: &[u8]| {
    // Backup import must never panic; it returns Ok or a typed error.
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(backup) = VaultBackup::from_json(s) {
            let _ = backup.verify();
        }

        // The text boundary always answers with a well-formed envelope
        let response = api::import_vault_backup(s);
        assert!(serde_json::from_str::<serde_json::Value>(&response).is_ok());
    }
});
