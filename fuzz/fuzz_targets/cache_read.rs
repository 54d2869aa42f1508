#![no_main]

use std::fs;

use kb_cache::{CacheStore, cache_path};
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let path = cache_path(td.path());
    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    if fs::write(path, data).is_ok() {
        let _ = CacheStore::new(td.path()).read();
    }
});
