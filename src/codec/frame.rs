//! Framed payload envelope.
//!
//! Field devices send either the modern array-tagged envelope (a leading
//! `0x00`, a message count, a length-prefix table, then the concatenated
//! protobuf payloads) or the deprecated single-message envelope (a leading
//! `0x08` followed directly by one protobuf payload). Both are accepted;
//! only a single decoded message is ever produced, since every observed
//! deployment sends exactly one message per frame and a count greater than
//! one indicates a firmware we don't understand yet.

const TAG_ARRAY: u8 = 0x00;
const TAG_LEGACY_SINGLE: u8 = 0x08;

/// Outcome of parsing one framed payload.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameResult {
    /// Exactly one protobuf payload was recovered.
    Single {
        payload: Vec<u8>,
        /// Set when the frame used the deprecated `0x08` single-message tag.
        legacy: bool,
    },
    /// The frame was well-formed but isn't one we forward.
    Dropped(DropReason),
}

#[derive(Debug, PartialEq, Eq)]
pub enum DropReason {
    Empty,
    UnknownTag(u8),
    UnsupportedCount(u8),
    Truncated,
}

/// Parse a framed payload (already hex-decoded) into a single message.
pub fn parse(data: &[u8]) -> FrameResult {
    let Some((&tag, rest)) = data.split_first() else {
        return FrameResult::Dropped(DropReason::Empty);
    };

    match tag {
        // The leading 0x08 is itself the protobuf field-1 tag byte, so the
        // whole buffer (not just what follows it) is the message.
        TAG_LEGACY_SINGLE => FrameResult::Single {
            payload: data.to_vec(),
            legacy: true,
        },
        TAG_ARRAY => parse_array(rest),
        other => FrameResult::Dropped(DropReason::UnknownTag(other)),
    }
}

fn parse_array(rest: &[u8]) -> FrameResult {
    let Some((&count, rest)) = rest.split_first() else {
        return FrameResult::Dropped(DropReason::Truncated);
    };

    if count != 1 {
        return FrameResult::Dropped(DropReason::UnsupportedCount(count));
    }

    let Some((&len, rest)) = rest.split_first() else {
        return FrameResult::Dropped(DropReason::Truncated);
    };
    let len = len as usize;

    if rest.len() < len {
        return FrameResult::Dropped(DropReason::Truncated);
    }

    FrameResult::Single {
        payload: rest[..len].to_vec(),
        legacy: false,
    }
}
