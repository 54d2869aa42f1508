#![no_main]

use kb::dispatch::normalize_tokens;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let tokens: Vec<String> = text.split_whitespace().map(str::to_string).collect();
        let normalized = normalize_tokens(&tokens);
        // Normalization may split the first token but never invents or
        // drops later ones.
        if !tokens.is_empty() {
            assert!(normalized.len() + 1 >= tokens.len());
        }
    }
});
