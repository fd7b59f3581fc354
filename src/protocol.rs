//! Device line protocol
//!
//! Decodes the newline-delimited text the slider box sends and encodes the
//! commands the host sends back. The bulk image framing shares the same link.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::fmt;

/// Banner printed once by the firmware after reset
pub const READY_BANNER: &str = "Arduino ready";

/// Header that precedes a raw image payload
pub const IMAGE_MAGIC: &[u8; 4] = b"IMG\n";

/// Shortest field that can carry `s<i>v<v>` / `b<i>v<v>`
const MIN_FIELD_LEN: usize = 4;

/// One decoded sensor frame
#[derive(Debug, Clone)]
pub struct ArduinoMessage {
    pub timestamp: DateTime<Local>,
    /// Slider index -> raw value as sent (normally 0-100, not validated)
    pub slider_values: BTreeMap<usize, i32>,
    /// Button index -> pressed
    pub button_states: BTreeMap<usize, bool>,
}

impl ArduinoMessage {
    /// Create an empty frame stamped with the current time
    pub fn new() -> Self {
        Self {
            timestamp: Local::now(),
            slider_values: BTreeMap::new(),
            button_states: BTreeMap::new(),
        }
    }

    /// Parse a data line such as `s0v75|b1v1`
    ///
    /// Malformed fields are skipped without affecting their siblings. When an
    /// index repeats, the last field wins.
    pub fn parse(line: &str) -> Self {
        let mut msg = Self::new();

        for field in line.split('|').map(str::trim) {
            if field.len() < MIN_FIELD_LEN {
                continue;
            }

            if let Some(rest) = field.strip_prefix('s') {
                if let Some((index, value)) = parse_index_value(rest) {
                    msg.slider_values.insert(index, value);
                }
            } else if let Some(rest) = field.strip_prefix('b') {
                if let Some((index, value)) = parse_index_value(rest) {
                    msg.button_states.insert(index, value == 1);
                }
            }
        }

        msg
    }

    /// True when the frame carried no recognised field
    pub fn is_empty(&self) -> bool {
        self.slider_values.is_empty() && self.button_states.is_empty()
    }
}

impl Default for ArduinoMessage {
    fn default() -> Self {
        Self::new()
    }
}

/// `<index>v<value>` with both sides decimal
fn parse_index_value(s: &str) -> Option<(usize, i32)> {
    let (index, value) = s.split_once('v')?;
    let index = index.trim().parse::<usize>().ok()?;
    let value = value.trim().parse::<i32>().ok()?;
    Some((index, value))
}

/// Classified line received from the device
#[derive(Debug, Clone)]
pub enum DeviceLine {
    /// Sensor frame to dispatch
    Frame(ArduinoMessage),
    /// `OK:<text>` command acknowledgement
    Ack(String),
    /// `ERROR:<text>` command rejection
    Error(String),
    /// Ready banner after reset
    Ready,
    /// Reply to `PING`
    Pong,
    /// Device asks for an image (`REQ`)
    ImageRequest,
    /// Nothing recognisable in the line
    Unrecognized(String),
}

impl DeviceLine {
    /// Classify one line. Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if let Some(text) = line.strip_prefix("OK:") {
            return Some(DeviceLine::Ack(text.trim().to_string()));
        }
        if let Some(text) = line.strip_prefix("ERROR:") {
            return Some(DeviceLine::Error(text.trim().to_string()));
        }

        let classified = match line {
            READY_BANNER => DeviceLine::Ready,
            "PONG" => DeviceLine::Pong,
            "REQ" => DeviceLine::ImageRequest,
            _ => {
                let msg = ArduinoMessage::parse(line);
                if msg.is_empty() {
                    DeviceLine::Unrecognized(line.to_string())
                } else {
                    DeviceLine::Frame(msg)
                }
            }
        };

        Some(classified)
    }

    /// Control replies are logged only, never dispatched
    pub fn is_control_reply(&self) -> bool {
        matches!(
            self,
            DeviceLine::Ack(_) | DeviceLine::Error(_) | DeviceLine::Ready | DeviceLine::Pong
        )
    }
}

/// Command sent from host to device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    /// Move slider `slider` to `percent`
    Set { slider: usize, percent: u8 },
    /// Liveness check, answered by `PONG`
    Ping,
}

impl HostCommand {
    /// Encode as a newline-terminated ASCII line
    pub fn encode(&self) -> Vec<u8> {
        format!("{}\n", self).into_bytes()
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostCommand::Set { slider, percent } => write!(f, "SET:{}:{}", slider, percent),
            HostCommand::Ping => write!(f, "PING"),
        }
    }
}

/// `IMG\n` + 4-byte big-endian payload length
pub fn image_header(payload_len: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(IMAGE_MAGIC.len() + 4);
    buf.put_slice(IMAGE_MAGIC);
    buf.put_u32(payload_len);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(line: &str) -> ArduinoMessage {
        match DeviceLine::parse(line) {
            Some(DeviceLine::Frame(msg)) => msg,
            other => panic!("expected frame for {:?}, got {:?}", line, other),
        }
    }

    #[test]
    fn test_slider_and_button_frame() {
        let msg = frame("s0v75|b1v1");
        assert_eq!(msg.slider_values, BTreeMap::from([(0, 75)]));
        assert_eq!(msg.button_states, BTreeMap::from([(1, true)]));
    }

    #[test]
    fn test_button_values_other_than_one_are_released() {
        let msg = frame("b0v0|b1v2|b2v1");
        assert_eq!(
            msg.button_states,
            BTreeMap::from([(0, false), (1, false), (2, true)])
        );
    }

    #[test]
    fn test_malformed_fields_do_not_affect_siblings() {
        let clean = ArduinoMessage::parse("s0v50|b1v1");
        let noisy = ArduinoMessage::parse("s0v50|xx|b1v1");
        assert_eq!(clean.slider_values, noisy.slider_values);
        assert_eq!(clean.button_states, noisy.button_states);

        let noisy = ArduinoMessage::parse("zz9v9|s0v50|sXvY|b1v1|s");
        assert_eq!(noisy.slider_values, BTreeMap::from([(0, 50)]));
        assert_eq!(noisy.button_states, BTreeMap::from([(1, true)]));
    }

    #[test]
    fn test_last_field_wins_for_repeated_index() {
        let msg = ArduinoMessage::parse("s2v10|s2v90");
        assert_eq!(msg.slider_values.get(&2), Some(&90));
    }

    #[test]
    fn test_out_of_range_values_pass_through() {
        let msg = ArduinoMessage::parse("s0v250|s1v-5");
        assert_eq!(msg.slider_values, BTreeMap::from([(0, 250), (1, -5)]));
    }

    #[test]
    fn test_control_replies() {
        assert!(matches!(
            DeviceLine::parse("OK:SET 0 50"),
            Some(DeviceLine::Ack(t)) if t == "SET 0 50"
        ));
        assert!(matches!(
            DeviceLine::parse("ERROR:bad slider"),
            Some(DeviceLine::Error(t)) if t == "bad slider"
        ));
        assert!(matches!(DeviceLine::parse("Arduino ready\r"), Some(DeviceLine::Ready)));
        assert!(matches!(DeviceLine::parse("PONG"), Some(DeviceLine::Pong)));
        assert!(matches!(DeviceLine::parse("REQ"), Some(DeviceLine::ImageRequest)));
        assert!(DeviceLine::parse("PONG").unwrap().is_control_reply());
        assert!(!DeviceLine::parse("REQ").unwrap().is_control_reply());
    }

    #[test]
    fn test_blank_and_unrecognized_lines() {
        assert!(DeviceLine::parse("   \r\n").is_none());
        assert!(matches!(
            DeviceLine::parse("hello there"),
            Some(DeviceLine::Unrecognized(_))
        ));
    }

    #[test]
    fn test_encode_commands() {
        assert_eq!(
            HostCommand::Set { slider: 3, percent: 42 }.encode(),
            b"SET:3:42\n".to_vec()
        );
        assert_eq!(HostCommand::Ping.encode(), b"PING\n".to_vec());
    }

    #[test]
    fn test_image_header_is_big_endian() {
        let header = image_header(30_000);
        assert_eq!(&header[..], &[b'I', b'M', b'G', b'\n', 0x00, 0x00, 0x75, 0x30]);
        assert_eq!(&header[..4], IMAGE_MAGIC);
    }

    proptest! {
        #[test]
        fn prop_frame_decodes_regardless_of_order_and_whitespace(
            slider in 0usize..64,
            value in 0i32..=100,
            button in 0usize..64,
            state in 0i32..3,
            swap in any::<bool>(),
            pad in "[ \t]{0,3}",
        ) {
            let s = format!("{pad}s{slider}v{value}{pad}");
            let b = format!("{pad}b{button}v{state}{pad}");
            let line = if swap { format!("{b}|{s}") } else { format!("{s}|{b}") };

            let msg = ArduinoMessage::parse(&line);
            prop_assert_eq!(msg.slider_values, BTreeMap::from([(slider, value)]));
            prop_assert_eq!(msg.button_states, BTreeMap::from([(button, state == 1)]));
        }
    }
}
