use std::fmt;

use crate::error::TranscriptError;

/// Which way a WebSocket message travelled through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to upstream. Replay expects to read it from the client.
    Inbound,
    /// Upstream to client. Replay writes it back.
    Outbound,
}

impl Direction {
    pub fn marker(self) -> u8 {
        match self {
            Direction::Inbound => b'>',
            Direction::Outbound => b'<',
        }
    }

    pub fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            b'>' => Some(Direction::Inbound),
            b'<' => Some(Direction::Outbound),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Inbound => "client -> upstream",
            Direction::Outbound => "upstream -> client",
        })
    }
}

/// One message of a WebSocket transcript.
///
/// On disk each entry is written as
///
/// ```text
/// <marker><len>\n<payload>\n
/// ```
///
/// where `len` counts the payload plus its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub direction: Direction,
    pub payload: Vec<u8>,
}

impl TranscriptEntry {
    pub fn new(direction: Direction, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            direction,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 16);
        out.push(self.direction.marker());
        out.extend_from_slice((self.payload.len() + 1).to_string().as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&self.payload);
        out.push(b'\n');
        out
    }
}

/// Parses a whole transcript, preserving recorded order.
pub fn parse_transcript(data: &[u8]) -> Result<Vec<TranscriptEntry>, TranscriptError> {
    let mut entries = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let marker = data[i];
        let direction =
            Direction::from_marker(marker).ok_or(TranscriptError::InvalidDirection {
                position: i,
                found: marker as char,
            })?;
        i += 1;

        let digits_start = i;
        while i < data.len() && data[i].is_ascii_digit() {
            i += 1;
        }
        if digits_start == i {
            return Err(TranscriptError::MissingLength(digits_start - 1));
        }
        let digits = String::from_utf8_lossy(&data[digits_start..i]).into_owned();
        let length: usize = digits
            .parse()
            .map_err(|_| TranscriptError::InvalidLength(digits.clone()))?;
        if length == 0 {
            return Err(TranscriptError::InvalidLength(digits));
        }

        // Separator between the length and the payload.
        i += 1;

        let end = i
            .checked_add(length)
            .filter(|end| *end <= data.len())
            .ok_or(TranscriptError::OutOfBounds {
                position: i,
                length,
            })?;
        entries.push(TranscriptEntry::new(direction, &data[i..end - 1]));
        i = end;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_length_including_newline() {
        assert_eq!(
            TranscriptEntry::new(Direction::Inbound, "hello").encode(),
            b">6\nhello\n".to_vec()
        );
        assert_eq!(
            TranscriptEntry::new(Direction::Outbound, "").encode(),
            b"<1\n\n".to_vec()
        );
    }

    #[test]
    fn parses_in_recorded_order() {
        let mut data = Vec::new();
        let entries = vec![
            TranscriptEntry::new(Direction::Inbound, "hello"),
            TranscriptEntry::new(Direction::Outbound, "world"),
            TranscriptEntry::new(Direction::Outbound, "multi\nline\n\npayload"),
            TranscriptEntry::new(Direction::Inbound, vec![0u8, 255, 10, b'<']),
        ];
        for entry in &entries {
            data.extend(entry.encode());
        }
        assert_eq!(parse_transcript(&data).unwrap(), entries);
    }

    #[test]
    fn empty_transcript() {
        assert!(parse_transcript(b"").unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_marker() {
        assert_eq!(
            parse_transcript(b">6\nhello\n!3\nab\n"),
            Err(TranscriptError::InvalidDirection {
                position: 9,
                found: '!'
            })
        );
    }

    #[test]
    fn rejects_missing_length() {
        assert_eq!(
            parse_transcript(b">\nhello\n"),
            Err(TranscriptError::MissingLength(0))
        );
    }

    #[test]
    fn rejects_zero_length() {
        assert!(matches!(
            parse_transcript(b"<0\n"),
            Err(TranscriptError::InvalidLength(_))
        ));
    }

    #[test]
    fn rejects_overlong_chunk() {
        assert_eq!(
            parse_transcript(b"<50\nshort\n"),
            Err(TranscriptError::OutOfBounds {
                position: 4,
                length: 50
            })
        );
    }

    #[test]
    fn huge_length_does_not_overflow() {
        let data = format!("<{}\nx\n", usize::MAX);
        assert!(matches!(
            parse_transcript(data.as_bytes()),
            Err(TranscriptError::OutOfBounds { .. })
        ));
    }
}
