//! Datapoint frames: `id: u8, type: u8, length: u16 BE, payload`

use bytes::{Buf, BufMut, Bytes, BytesMut};
use compact_str::CompactString;
use kitsune_common::Lookup as _;

const HEADER_LEN: usize = 4;

kitsune_common::lookup! {
    pub enum DatapointType {
        Raw = 0 => "raw",
        Bool = 1 => "bool",
        Value = 2 => "value",
        String = 3 => "string",
        Enum = 4 => "enum",
        Bitmap = 5 => "bitmap",
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("datapoint {id}: unknown type tag {tag}")]
    UnknownType { id: u8, tag: u8 },
    #[error("datapoint {id}: {len} byte payload is invalid for type {kind:?}")]
    InvalidLength { id: u8, kind: DatapointType, len: usize },
    #[error("datapoint {id}: string is not valid UTF-8")]
    InvalidUtf8 { id: u8 },
    #[error("truncated frame: {needed} bytes needed, {available} available")]
    Truncated { id: Option<u8>, needed: usize, available: usize },
    #[error("datapoint {id}: {len} byte payload does not fit a frame")]
    PayloadTooLong { id: u8, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatapointValue {
    Raw(Bytes),
    Bool(bool),
    Int32(i32),
    Str(CompactString),
    EnumIndex(u8),
    Bitmap(Bytes),
}

impl DatapointValue {
    pub fn kind(&self) -> DatapointType {
        match self {
            DatapointValue::Raw(_) => DatapointType::Raw,
            DatapointValue::Bool(_) => DatapointType::Bool,
            DatapointValue::Int32(_) => DatapointType::Value,
            DatapointValue::Str(_) => DatapointType::String,
            DatapointValue::EnumIndex(_) => DatapointType::Enum,
            DatapointValue::Bitmap(_) => DatapointType::Bitmap,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            DatapointValue::Raw(bytes) | DatapointValue::Bitmap(bytes) => bytes.len(),
            DatapointValue::Bool(_) | DatapointValue::EnumIndex(_) => 1,
            DatapointValue::Int32(_) => 4,
            DatapointValue::Str(s) => s.len(),
        }
    }

    fn put(&self, out: &mut impl BufMut) {
        match self {
            DatapointValue::Raw(bytes) | DatapointValue::Bitmap(bytes) => out.put_slice(bytes),
            DatapointValue::Bool(v) => out.put_u8(u8::from(*v)),
            DatapointValue::Int32(v) => out.put_i32(*v),
            DatapointValue::Str(s) => out.put_slice(s.as_bytes()),
            DatapointValue::EnumIndex(v) => out.put_u8(*v),
        }
    }

    fn parse(id: u8, kind: DatapointType, mut payload: Bytes) -> Result<Self, FrameError> {
        let len = payload.len();
        let invalid = || FrameError::InvalidLength { id, kind, len };

        Ok(match kind {
            DatapointType::Raw => DatapointValue::Raw(payload),
            DatapointType::Bool if len == 1 => DatapointValue::Bool(payload.get_u8() != 0),
            DatapointType::Value if len == 4 => DatapointValue::Int32(payload.get_i32()),
            DatapointType::Enum if len == 1 => DatapointValue::EnumIndex(payload.get_u8()),
            DatapointType::Bitmap => DatapointValue::Bitmap(payload),
            DatapointType::String => {
                let s = core::str::from_utf8(&payload).map_err(|_| FrameError::InvalidUtf8 { id })?;
                DatapointValue::Str(s.into())
            }
            DatapointType::Bool | DatapointType::Value | DatapointType::Enum => return Err(invalid()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datapoint {
    pub id: u8,
    pub value: DatapointValue,
}

impl Datapoint {
    pub fn new(id: u8, value: DatapointValue) -> Self {
        Self { id, value }
    }
}

/// Everything that could be read out of a buffer of frames
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    pub datapoints: Vec<Datapoint>,
    /// Complete frames that were skipped
    pub errors: Vec<FrameError>,
    /// Set when the buffer ended in the middle of a frame
    pub incomplete: Option<FrameError>,
}

impl Decoded {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.incomplete.is_none()
    }
}

/// Decodes frames until the buffer is exhausted. A malformed frame is skipped without
/// affecting its siblings; a truncated trailing frame ends decoding.
pub fn decode(mut data: impl Buf) -> Decoded {
    let mut out = Decoded::default();

    while data.has_remaining() {
        if data.remaining() < HEADER_LEN {
            out.incomplete = Some(FrameError::Truncated {
                id: Some(data.chunk()[0]),
                needed: HEADER_LEN,
                available: data.remaining(),
            });
            break;
        }

        let id = data.get_u8();
        let tag = data.get_u8();
        let len = data.get_u16() as usize;
        tracing::trace!(id, tag, len, "datapoint frame");

        if data.remaining() < len {
            out.incomplete = Some(FrameError::Truncated {
                id: Some(id),
                needed: len,
                available: data.remaining(),
            });
            break;
        }

        let payload = data.copy_to_bytes(len);

        let parsed = DatapointType::from_value(tag.into())
            .ok_or(FrameError::UnknownType { id, tag })
            .and_then(|kind| DatapointValue::parse(id, kind, payload));

        match parsed {
            Ok(value) => out.datapoints.push(Datapoint { id, value }),
            Err(error) => {
                tracing::warn!(%error, "skipping datapoint frame");
                out.errors.push(error);
            }
        }
    }

    if let Some(error) = &out.incomplete {
        tracing::warn!(%error, decoded = out.datapoints.len(), "incomplete datapoint buffer");
    }

    out
}

pub fn encode(datapoints: &[Datapoint]) -> Result<Bytes, FrameError> {
    let mut out = BytesMut::new();

    for Datapoint { id, value } in datapoints {
        let len = value.payload_len();
        let Ok(wire_len) = u16::try_from(len) else {
            return Err(FrameError::PayloadTooLong { id: *id, len });
        };

        out.reserve(HEADER_LEN + len);
        out.put_u8(*id);
        out.put_u8(value.kind().value() as u8);
        out.put_u16(wire_len);
        value.put(&mut out);
    }

    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_every_type() {
        #[rustfmt::skip]
        let data: &[u8] = &[
            0x01, 0x01, 0x00, 0x01, 0x01,
            0x02, 0x02, 0x00, 0x04, 0xff, 0xff, 0xff, 0x38,
            0x03, 0x03, 0x00, 0x02, b'o', b'k',
            0x04, 0x04, 0x00, 0x01, 0x02,
            0x05, 0x05, 0x00, 0x02, 0x80, 0x01,
            0x06, 0x00, 0x00, 0x03, 0xaa, 0xbb, 0xcc,
        ];

        let decoded = decode(data);
        assert!(decoded.is_clean());
        assert_eq!(decoded.datapoints, [
            Datapoint::new(1, DatapointValue::Bool(true)),
            Datapoint::new(2, DatapointValue::Int32(-200)),
            Datapoint::new(3, DatapointValue::Str("ok".into())),
            Datapoint::new(4, DatapointValue::EnumIndex(2)),
            Datapoint::new(5, DatapointValue::Bitmap(Bytes::from_static(&[0x80, 0x01]))),
            Datapoint::new(6, DatapointValue::Raw(Bytes::from_static(&[0xaa, 0xbb, 0xcc]))),
        ]);
    }

    #[test]
    fn truncated_trailing_frame() {
        let data: &[u8] = &[0x01, 0x01, 0x00, 0x01, 0x00, 0x02, 0x02, 0x00, 0x04, 0x00, 0x00];

        let decoded = decode(data);
        assert_eq!(decoded.datapoints, [Datapoint::new(1, DatapointValue::Bool(false))]);
        assert_eq!(
            decoded.incomplete,
            Some(FrameError::Truncated { id: Some(2), needed: 4, available: 2 })
        );
        assert!(decoded.errors.is_empty());

        let decoded = decode(&[0x09, 0x01][..]);
        assert!(decoded.datapoints.is_empty());
        assert_eq!(
            decoded.incomplete,
            Some(FrameError::Truncated { id: Some(9), needed: 4, available: 2 })
        );
    }

    #[test]
    fn malformed_frames_are_skipped() {
        #[rustfmt::skip]
        let data: &[u8] = &[
            0x01, 0x09, 0x00, 0x01, 0x00,
            0x02, 0x01, 0x00, 0x02, 0x00, 0x01,
            0x03, 0x03, 0x00, 0x02, 0xc3, 0x28,
            0x04, 0x04, 0x00, 0x01, 0x07,
        ];

        let decoded = decode(data);
        assert_eq!(decoded.datapoints, [Datapoint::new(4, DatapointValue::EnumIndex(7))]);
        assert_eq!(decoded.errors, [
            FrameError::UnknownType { id: 1, tag: 9 },
            FrameError::InvalidLength { id: 2, kind: DatapointType::Bool, len: 2 },
            FrameError::InvalidUtf8 { id: 3 },
        ]);
        assert_eq!(decoded.incomplete, None);
    }

    #[test]
    fn encode_frames() {
        let encoded = encode(&[
            Datapoint::new(2, DatapointValue::Int32(215)),
            Datapoint::new(4, DatapointValue::EnumIndex(1)),
        ])
        .unwrap();

        assert_eq!(&encoded[..], [0x02, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0xd7, 0x04, 0x04, 0x00, 0x01, 0x01]);
        assert_eq!(decode(encoded).datapoints.len(), 2);
    }

    #[test]
    fn every_type_decodes_as_encoded() {
        let values = [
            DatapointValue::Raw(Bytes::new()),
            DatapointValue::Raw(Bytes::from_static(&[0x00, 0xff, 0x10])),
            DatapointValue::Bool(false),
            DatapointValue::Bool(true),
            DatapointValue::Int32(i32::MIN),
            DatapointValue::Int32(i32::MAX),
            DatapointValue::Int32(0),
            DatapointValue::Str("".into()),
            DatapointValue::Str("Küche 🔥".into()),
            DatapointValue::EnumIndex(0),
            DatapointValue::EnumIndex(u8::MAX),
            DatapointValue::Bitmap(Bytes::new()),
            DatapointValue::Bitmap(Bytes::from_static(&[0x80, 0x00, 0x01])),
        ];

        let datapoints: Vec<_> = values
            .into_iter()
            .enumerate()
            .map(|(id, value)| Datapoint::new(id as u8 + 1, value))
            .collect();

        for datapoint in &datapoints {
            let decoded = decode(encode(core::slice::from_ref(datapoint)).unwrap());
            assert!(decoded.is_clean());
            assert_eq!(decoded.datapoints, [datapoint.clone()]);
        }

        let decoded = decode(encode(&datapoints).unwrap());
        assert!(decoded.is_clean());
        assert_eq!(decoded.datapoints, datapoints);
    }

    #[test]
    fn longest_payload_fits() {
        let raw = Datapoint::new(1, DatapointValue::Raw(Bytes::from(vec![0xab; u16::MAX as usize])));

        assert_eq!(decode(encode(core::slice::from_ref(&raw)).unwrap()).datapoints, [raw]);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let raw = DatapointValue::Raw(Bytes::from(vec![0; u16::MAX as usize + 1]));

        assert_eq!(
            encode(&[Datapoint::new(7, raw)]),
            Err(FrameError::PayloadTooLong { id: 7, len: 65536 })
        );
    }
}
