#![no_main]

use kb::dispatch::parse_flags;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let args: Vec<String> = text.split_whitespace().map(str::to_string).collect();
        if let Ok((flags, positionals)) = parse_flags(&[], &args) {
            // Without declarations every token is either a passthrough
            // flag or a positional; nothing is lost.
            assert!(flags.len() + positionals.len() <= args.len());
        }
    }
});
