//! Property tests: decoding must not depend on how the byte stream is
//! split across reads.

use proptest::prelude::*;

use hearth_core::Method;
use hearth_http::{FrameDecoder, Message, ParseLimits, RequestDecoder};

/// Turns raw split offsets into sorted feed boundaries ending at `len`.
fn split_positions(splits: Vec<usize>, len: usize) -> Vec<usize> {
    let mut positions: Vec<usize> = splits.into_iter().map(|s| s % (len + 1)).collect();
    positions.sort_unstable();
    positions.push(len);
    positions
}

fn masked_frame(opcode: u8, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut out = vec![0x80 | (opcode & 0x0f)];
    match payload.len() {
        len if len < 126 => out.push(0x80 | len as u8),
        len if len <= 0xFFFF => {
            out.push(0x80 | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            out.push(0x80 | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(&mask);
    for (i, &b) in payload.iter().enumerate() {
        out.push(b ^ mask[i & 3]);
    }
    out
}

proptest! {
    #[test]
    fn http_request_decoding_is_split_invariant(
        splits in proptest::collection::vec(0usize..200, 0..8),
        body in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let mut raw = format!(
            "POST /items?q=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(&body);

        let mut decoder = RequestDecoder::new(ParseLimits::default());
        let mut result = None;
        let mut prev = 0;
        for pos in split_positions(splits, raw.len()) {
            decoder.push(&raw[prev..pos]);
            while let Some(request) = decoder.poll().expect("decode must not fail") {
                result = Some(request);
            }
            prev = pos;
        }

        let request = result.expect("request must complete once all bytes arrived");
        prop_assert_eq!(request.method(), Method::Post);
        prop_assert_eq!(request.path(), "/items");
        prop_assert_eq!(request.query(), Some("q=1"));
        prop_assert_eq!(request.body(), &body[..]);
        prop_assert!(request.keep_alive());
    }

    #[test]
    fn ws_frame_decoding_is_split_invariant(
        splits in proptest::collection::vec(0usize..400, 0..8),
        payload in proptest::collection::vec(any::<u8>(), 0..300),
        mask in any::<[u8; 4]>(),
    ) {
        let raw = masked_frame(0x2, &payload, mask);

        let mut decoder = FrameDecoder::new(64 * 1024);
        let mut result = None;
        let mut prev = 0;
        for pos in split_positions(splits, raw.len()) {
            decoder.push(&raw[prev..pos]);
            while let Some(message) = decoder.poll().expect("decode must not fail") {
                result = Some(message);
            }
            prev = pos;
        }

        let message = result.expect("frame must complete once all bytes arrived");
        prop_assert_eq!(message, Message::Binary(payload));
    }

    #[test]
    fn pipelined_requests_decode_in_order_regardless_of_splits(
        splits in proptest::collection::vec(0usize..100, 0..6),
    ) {
        let raw = b"GET /first HTTP/1.1\r\nHost: x\r\n\r\nGET /second HTTP/1.1\r\nHost: x\r\n\r\n";

        let mut decoder = RequestDecoder::new(ParseLimits::default());
        let mut paths = Vec::new();
        let mut prev = 0;
        for pos in split_positions(splits, raw.len()) {
            decoder.push(&raw[prev..pos]);
            while let Some(request) = decoder.poll().expect("decode must not fail") {
                paths.push(request.path().to_string());
            }
            prev = pos;
        }

        prop_assert_eq!(paths, vec!["/first".to_string(), "/second".to_string()]);
    }
}
