#![no_main]

use kb_types::Manifest;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(manifest) = serde_json::from_str::<Manifest>(text) {
            let _ = manifest.group_name();
            let _ = manifest.command_name();
            let _ = manifest.space_form();
            let _ = serde_json::to_string(&manifest);
        }
    }
});
