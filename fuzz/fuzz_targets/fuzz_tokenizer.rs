#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let tokens = fmail_data::utils::extract_tokens(text);
        for token in fmail_data::utils::tokenize_query(text) {
            assert!(tokens.contains(&token));
        }
        // A text always contains itself; offsets must stay inside the haystack
        if let Some((offset, len)) = fmail_data::query::find_substring(text, text) {
            assert!(offset + len <= text.len());
        }
    }
});
