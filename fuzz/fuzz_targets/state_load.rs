#![no_main]

use std::fs;

use kb_state::{StateStore, state_path};
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let path = state_path(td.path());
    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    if fs::write(path, data).is_ok() {
        let _ = StateStore::new(td.path()).load();
    }
});
