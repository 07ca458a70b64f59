//! The APNs v2 binary wire format: frame encoding, error responses, and
//! feedback records. Pure functions only — no I/O.

use crate::message::{Notification, Reason};

const ITEM_TOKEN: u8 = 1;
const ITEM_PAYLOAD: u8 = 2;
const ITEM_IDENT: u8 = 3;
const ITEM_EXPIRATION: u8 = 4;
const ITEM_PRIORITY: u8 = 5;

const COMMAND_FRAME: u8 = 2;
const COMMAND_ERROR: u8 = 8;
const STATUS_SHUTDOWN: u8 = 10;

/// Encodes a notification into a complete APNs v2 frame, ready to be put on
/// the wire.
pub fn encode_frame(notification: &Notification) -> Vec<u8> {
    let message = &notification.message;

    let mut content = Vec::new();
    push_item(&mut content, ITEM_TOKEN, &notification.encoded_token);
    push_item(&mut content, ITEM_PAYLOAD, &message.encoded_payload);

    if let Some(ident) = notification.ident {
        push_item(&mut content, ITEM_IDENT, &ident.to_be_bytes());
    }

    if let Some(expiration) = message.encoded_expiration {
        push_item(&mut content, ITEM_EXPIRATION, &expiration.to_be_bytes());
    }

    if let Some(priority) = message.priority {
        push_item(&mut content, ITEM_PRIORITY, &[priority]);
    }

    let mut frame = Vec::with_capacity(5 + content.len());
    frame.push(COMMAND_FRAME);
    frame.extend_from_slice(&(content.len() as u32).to_be_bytes());
    frame.extend_from_slice(&content);
    frame
}

fn push_item(buf: &mut Vec<u8>, item_id: u8, data: &[u8]) {
    buf.push(item_id);
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(data);
}

/// A parsed 6-byte response frame from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorResponse {
    /// A per-notification rejection.
    Rejected { reason: Reason, ident: u32 },
    /// Status 10: the server is closing the connection cleanly. `ident` is
    /// the last notification it accepted.
    Shutdown { ident: u32 },
}

/// Parses a 6-byte APNs error frame: `<command=8><status><ident>`.
///
/// Returns `None` if `buf` is not a well-formed error frame (wrong length or
/// unexpected command byte); the caller should log and treat this as
/// connection loss.
pub fn parse_error_response(buf: &[u8]) -> Option<ErrorResponse> {
    if buf.len() != 6 || buf[0] != COMMAND_ERROR {
        return None;
    }

    let status = buf[1];
    let ident = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);

    Some(if status == STATUS_SHUTDOWN {
        ErrorResponse::Shutdown { ident }
    } else {
        ErrorResponse::Rejected {
            reason: Reason::from_status(status),
            ident,
        }
    })
}

/// A single feedback record: `<timestamp><token-length><token>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackRecord {
    pub timestamp: u32,
    pub encoded_token: Vec<u8>,
}

/// Attempts to parse one feedback record from the front of `buf`.
///
/// Returns `(Some(record), remainder)` on success, or `(None, buf)`
/// unchanged if `buf` doesn't yet contain a complete record (the caller
/// should await more input and retry).
pub fn parse_feedback_record(buf: &[u8]) -> (Option<FeedbackRecord>, &[u8]) {
    if buf.len() < 6 {
        return (None, buf);
    }

    let timestamp = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let token_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;

    if buf.len() < 6 + token_len {
        return (None, buf);
    }

    let encoded_token = buf[6..6 + token_len].to_vec();
    let record = FeedbackRecord {
        timestamp,
        encoded_token,
    };

    (Some(record), &buf[6 + token_len..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::sync::Arc;

    fn notification(ident: Option<u32>, expiration: Option<u32>, priority: Option<u8>) -> Notification {
        let message = Message {
            encoded_tokens: vec![[0xAA; 32]],
            encoded_payload: br#"{"aps":{"badge":1}}"#.to_vec(),
            encoded_expiration: expiration,
            priority,
        };

        Notification {
            message: Arc::new(message),
            encoded_token: [0xAA; 32],
            ident,
        }
    }

    /// Walks the item stream of an encoded frame and returns `(item_id, data)`
    /// pairs, without assuming which items are present.
    fn items(frame: &[u8]) -> Vec<(u8, Vec<u8>)> {
        assert_eq!(frame[0], COMMAND_FRAME);
        let len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        let content = &frame[5..];
        assert_eq!(content.len(), len);

        let mut out = Vec::new();
        let mut i = 0;
        while i < content.len() {
            let id = content[i];
            let item_len = u16::from_be_bytes([content[i + 1], content[i + 2]]) as usize;
            let data = content[i + 3..i + 3 + item_len].to_vec();
            out.push((id, data));
            i += 3 + item_len;
        }
        out
    }

    #[test]
    fn encode_frame_includes_only_present_optional_items() {
        let notification = notification(Some(7), None, None);
        let parsed = items(&encode_frame(&notification));

        assert_eq!(parsed[0], (ITEM_TOKEN, vec![0xAA; 32]));
        assert_eq!(parsed[1].0, ITEM_PAYLOAD);
        assert_eq!(parsed[2], (ITEM_IDENT, 7u32.to_be_bytes().to_vec()));
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn encode_frame_omits_the_identifier_item_when_unset() {
        let notification = notification(None, None, None);
        let frame = encode_frame(&notification);
        let parsed = items(&frame);

        assert_eq!(parsed[0], (ITEM_TOKEN, vec![0xAA; 32]));
        assert_eq!(parsed[1].0, ITEM_PAYLOAD);
        assert_eq!(parsed.len(), 2);

        // Token item (3 + 32) + payload item (3 + 19) = 57 = 0x39, matching
        // the encoded content length for a notification with no identifier.
        assert_eq!(u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]), 57);
    }

    #[test]
    fn encode_frame_includes_expiration_and_priority_when_set() {
        let notification = notification(Some(42), Some(1_700_000_000), Some(10));
        let parsed = items(&encode_frame(&notification));

        assert_eq!(parsed.len(), 5);
        assert_eq!(
            parsed[3],
            (ITEM_EXPIRATION, 1_700_000_000u32.to_be_bytes().to_vec())
        );
        assert_eq!(parsed[4], (ITEM_PRIORITY, vec![10]));
    }

    #[test]
    fn parse_error_response_distinguishes_shutdown_from_rejection() {
        let shutdown = [COMMAND_ERROR, 10, 0, 0, 0, 5];
        assert_eq!(
            parse_error_response(&shutdown),
            Some(ErrorResponse::Shutdown { ident: 5 })
        );

        let rejected = [COMMAND_ERROR, 8, 0, 0, 0, 9];
        assert_eq!(
            parse_error_response(&rejected),
            Some(ErrorResponse::Rejected {
                reason: Reason::InvalidToken,
                ident: 9
            })
        );
    }

    #[test]
    fn parse_error_response_rejects_malformed_frames() {
        assert_eq!(parse_error_response(&[COMMAND_ERROR, 8, 0, 0, 0]), None);
        assert_eq!(parse_error_response(&[0, 8, 0, 0, 0, 1]), None);
    }

    #[test]
    fn parse_feedback_record_waits_for_a_complete_record() {
        let mut buf = vec![0u8, 0, 0, 1, 0, 4, 0xDE, 0xAD, 0xBE, 0xEF];
        buf.extend_from_slice(&[0, 0, 0, 2, 0, 2, 0xCA, 0xFE]);

        let (first, rest) = parse_feedback_record(&buf);
        let first = first.unwrap();
        assert_eq!(first.timestamp, 1);
        assert_eq!(first.encoded_token, vec![0xDE, 0xAD, 0xBE, 0xEF]);

        let (second, rest) = parse_feedback_record(rest);
        let second = second.unwrap();
        assert_eq!(second.timestamp, 2);
        assert_eq!(second.encoded_token, vec![0xCA, 0xFE]);
        assert!(rest.is_empty());
    }

    #[test]
    fn parse_feedback_record_leaves_incomplete_input_untouched() {
        let buf = vec![0u8, 0, 0, 1, 0, 4, 0xDE, 0xAD];
        let (record, remainder) = parse_feedback_record(&buf);
        assert!(record.is_none());
        assert_eq!(remainder, &buf[..]);
    }
}
