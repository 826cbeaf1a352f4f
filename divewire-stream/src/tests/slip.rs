use super::*;
use crate::error::Error;
use crate::mocks::{run, ScriptedStream};

#[test]
fn encode_uses_the_classical_codes() {
    let s = ScriptedStream::new()
        .expect(&[0xC0, 0x01, 0xDB, 0xDC, 0x02, 0xDB, 0xDD, 0x03, 0xC0]);
    let mut slip = Slip::new(s);
    assert_eq!(run(slip.write(&[0x01, 0xC0, 0x02, 0xDB, 0x03])), Ok(5));
}

#[test]
fn decode_reverses_encode() {
    let s = ScriptedStream::new()
        .supply(&[0xC0, 0x01, 0xDB, 0xDC, 0x02, 0xDB, 0xDD, 0x03, 0xC0]);
    let mut slip = Slip::new(s);
    let mut data = [0u8; 8];
    assert_eq!(run(slip.read(&mut data)), Ok(5));
    assert_eq!(&data[..5], &[0x01, 0xC0, 0x02, 0xDB, 0x03]);
}

#[test]
fn empty_frames_are_dropped() {
    // leading delimiter, a wholly empty frame, then a real one
    let s = ScriptedStream::new()
        .supply(&[0xC0, 0xC0, 0xC0, 0x42, 0x43, 0xC0]);
    let mut slip = Slip::new(s);
    let mut data = [0u8; 8];
    assert_eq!(run(slip.read(&mut data)), Ok(2));
    assert_eq!(&data[..2], &[0x42, 0x43]);
}

#[test]
fn stray_escape_is_a_protocol_error() {
    let s = ScriptedStream::new().supply(&[0xC0, 0xDB, 0x55]);
    let mut slip = Slip::new(s);
    let mut data = [0u8; 8];
    assert_eq!(run(slip.read(&mut data)), Err(Error::Protocol));
}

#[test]
fn frame_served_across_short_reads() {
    let s = ScriptedStream::new().supply(&[0xC0, 1, 2, 3, 0xC0]);
    let mut slip = Slip::new(s);
    let mut data = [0u8; 2];
    assert_eq!(run(slip.read(&mut data)), Ok(2));
    assert_eq!(data, [1, 2]);
    assert_eq!(run(slip.read(&mut data)), Ok(1));
    assert_eq!(data[0], 3);
}

#[test]
fn silence_times_out() {
    let s = ScriptedStream::new();
    let mut slip = Slip::new(s);
    let mut data = [0u8; 2];
    assert_eq!(run(slip.read(&mut data)), Err(Error::Timeout));
}
