//! Splitting a raw firehose frame into its header and body.
//!
//! A frame is two concatenated DAG-CBOR values. The header is a map
//! `{"op": 1, "t": "#commit"}` for messages or `{"op": -1}` for error
//! frames; everything after the header is the body, carried opaquely
//! here and interpreted by [`crate::commit`]. See the
//! [event stream specs](https://atproto.com/specs/event-stream).


use cbor4ii::core::utils::IoReader;
use ipld_core::ipld::Ipld;
use serde::Deserialize;
use serde_ipld_dagcbor::de::Deserializer;
use std::io::Cursor;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unknown frame type, header: {0:?}")]
    UnknownFrameType(Ipld),
    #[error("frame carried no body, header: {0:?}")]
    EmptyBody(Ipld),
    #[error("dag-cbor decoding error: {0}")]
    Decode(#[from] serde_ipld_dagcbor::DecodeError<std::io::Error>),
}

/// The first DAG-CBOR value of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FrameHeader {
    /// `op = 1`; `t` discriminates the body type (`#commit`, ...).
    Message { t: String },
    /// `op = -1`; the body describes a stream-level error.
    Error,
}

impl TryFrom<Ipld> for FrameHeader {
    type Error = FrameError;

    fn try_from(header: Ipld) -> Result<Self, FrameError> {
        let parsed = match &header {
            Ipld::Map(map) => match (map.get("op"), map.get("t")) {
                (Some(Ipld::Integer(1)), Some(Ipld::String(t))) => {
                    Some(Self::Message { t: t.clone() })
                }
                // Error headers carry no `t`.
                (Some(Ipld::Integer(-1)), _) => Some(Self::Error),
                _ => None,
            },
            _ => None,
        };
        parsed.ok_or(FrameError::UnknownFrameType(header))
    }
}

/// A decoded frame: the typed header plus the raw bytes of the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message { t: String, body: Vec<u8> },
    Error { body: Vec<u8> },
}

impl TryFrom<Vec<u8>> for Frame {
    type Error = FrameError;

    fn try_from(value: Vec<u8>) -> Result<Self, FrameError> {
        let mut cursor = Cursor::new(value);
        let header: Ipld = {
            let mut deserializer = Deserializer::from_reader(IoReader::new(&mut cursor));
            let header = Deserialize::deserialize(&mut deserializer)?;
            // `end()` succeeding means nothing follows the header, so
            // there is no body to interpret.
            if deserializer.end().is_ok() {
                return Err(FrameError::EmptyBody(header));
            }
            header
        };
        // The cursor sits exactly at the header/body boundary.
        let position = cursor.position() as usize;
        let body = cursor.into_inner().split_off(position);

        match FrameHeader::try_from(header)? {
            FrameHeader::Message { t } => Ok(Self::Message { t, body }),
            FrameHeader::Error => Ok(Self::Error { body }),
        }
    }
}
