#![no_main]

use fmail_data::daemon::protocol::{FrameReader, ReadOutcome, decode_ack, decode_frame};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = decode_ack(data);
    let _ = decode_frame(data);

    // Split the same bytes into frames and decode each one
    let mut reader = FrameReader::with_limit(data, 4096);
    while let Ok(ReadOutcome::Frame(line)) = reader.next_frame() {
        let _ = decode_frame(&line);
    }
});
