#![no_main]

use healthd_core::i2c::{BusFaultLatch, I2cEvent};
use libfuzzer_sys::fuzz_target;

fn status_for(chunk: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw[..chunk.len()].copy_from_slice(chunk);
    match raw[3] % 4 {
        // mostly the low byte, where the defined flags live
        0 | 1 => u32::from(raw[0]),
        2 => 0,
        _ => u32::from_le_bytes(raw),
    }
}

fuzz_target!(|data: &[u8]| {
    let mut latch = BusFaultLatch::default();
    for chunk in data.chunks(4) {
        let status = status_for(chunk);
        let before = latch.bits();
        let out = latch.decode(status);

        let asserts = out
            .events
            .iter()
            .filter(|e| matches!(e, I2cEvent::Assert(_)))
            .count();
        assert_eq!(out.crash_assert, asserts > 0);

        if status == 0 {
            assert_eq!(latch.bits(), 0);
            assert_eq!(out.crash_deassert, before != 0);
        } else {
            assert!(!out.crash_deassert);
            // latches only accumulate while the bus is faulty
            assert_eq!(latch.bits() & before, before);
        }

        // a second identical word never re-asserts
        let again = latch.decode(status);
        if status != 0 {
            assert!(!again.crash_assert);
        }
    }
});
