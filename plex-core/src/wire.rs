//! Framing: length-prefix (4 bytes LE) + codec payload. Codec is pluggable.

use serde::{Deserialize, Serialize};

use crate::protocol::{Frame, Outcome, Value};

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Turns frames into payload bytes and back. Length prefixing is not the codec's job.
pub trait Codec: Send + Sync {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, FrameEncodeError>;
    fn decode(&self, bytes: &[u8]) -> Result<Frame, FrameDecodeError>;
}

/// Compact binary codec (serde + bincode).
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
        bincode::serialize(frame).map_err(FrameEncodeError::Bincode)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
        bincode::deserialize(bytes).map_err(FrameDecodeError::Bincode)
    }
}

/// Human-readable codec (serde_json), handy when sniffing a transport.
/// JSON has no NaN or infinity, so frames carrying them are refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
        if !carries_only_finite_floats(frame) {
            return Err(FrameEncodeError::NonFinite);
        }
        serde_json::to_vec(frame).map_err(FrameEncodeError::Json)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
        serde_json::from_slice(bytes).map_err(FrameDecodeError::Json)
    }
}

fn carries_only_finite_floats(frame: &Frame) -> bool {
    match frame {
        Frame::Call { args, .. } => args.iter().all(Value::is_finite),
        Frame::Result {
            outcome: Outcome::Values(values),
            ..
        } => values.iter().all(Value::is_finite),
        Frame::Chunk { payload, .. } => payload.is_finite(),
        _ => true,
    }
}

/// Codec selection for configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Bincode,
    Json,
}

impl CodecKind {
    pub fn codec(self) -> Box<dyn Codec> {
        match self {
            CodecKind::Bincode => Box::new(BincodeCodec),
            CodecKind::Json => Box::new(JsonCodec),
        }
    }
}

impl std::str::FromStr for CodecKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bincode" => Ok(CodecKind::Bincode),
            "json" => Ok(CodecKind::Json),
            other => Err(format!("unknown codec: {other}")),
        }
    }
}

/// Encode a frame into 4 bytes LE length + codec payload.
pub fn encode_frame(codec: &dyn Codec, frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = codec.encode(frame)?;
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Read the length prefix at the front of `bytes`. `NeedMore` if fewer than 4 bytes.
pub fn frame_len(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (try again after more data).
pub fn decode_frame(codec: &dyn Codec, bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    let len = frame_len(bytes)?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame = codec.decode(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((frame, LEN_SIZE + len))
}

/// Error encoding a frame (codec or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("bincode encode error: {0}")]
    Bincode(bincode::Error),
    #[error("json encode error: {0}")]
    Json(serde_json::Error),
    #[error("frame too large")]
    TooLarge,
    #[error("NaN or infinite float has no json form")]
    NonFinite,
}

/// Error decoding a frame (need more bytes, too large, or codec failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("bincode decode error: {0}")]
    Bincode(bincode::Error),
    #[error("json decode error: {0}")]
    Json(serde_json::Error),
}

impl FrameDecodeError {
    /// Body was delimited correctly but could not be parsed; the stream itself is still in sync.
    pub fn is_malformed_body(&self) -> bool {
        matches!(self, FrameDecodeError::Bincode(_) | FrameDecodeError::Json(_))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::protocol::{
        ChannelRef, Encoding, MethodDescriptor, Owner, ResultShape, StreamSpec, Value,
        PROTOCOL_VERSION,
    };

    fn sample_registry() -> Frame {
        Frame::Registry {
            version: PROTOCOL_VERSION,
            window: 16,
            methods: vec![
                MethodDescriptor::new("echo", ResultShape::Callback).with_arity(1),
                MethodDescriptor::new(
                    "tail",
                    ResultShape::Stream(StreamSpec::read(Encoding::Utf8)),
                ),
            ],
        }
    }

    fn nested_value() -> Value {
        let mut map = BTreeMap::new();
        map.insert("n".to_string(), Value::Int(-3));
        map.insert("f".to_string(), Value::Float(1.5));
        map.insert("raw".to_string(), Value::Bytes(vec![0, 255, 7]));
        Value::List(vec![
            Value::Null,
            Value::Bool(true),
            Value::Str("héllo".into()),
            Value::Map(map),
        ])
    }

    #[test]
    fn registry_survives_both_codecs() {
        for codec in [CodecKind::Bincode.codec(), CodecKind::Json.codec()] {
            let msg = sample_registry();
            let frame = encode_frame(codec.as_ref(), &msg).unwrap();
            let (decoded, n) = decode_frame(codec.as_ref(), &frame).unwrap();
            assert_eq!(n, frame.len());
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn values_keep_their_variant() {
        for codec in [CodecKind::Bincode.codec(), CodecKind::Json.codec()] {
            let msg = Frame::Call {
                id: 9,
                method: "echo".into(),
                args: vec![nested_value(), Value::Int(1), Value::Float(1.0)],
            };
            let frame = encode_frame(codec.as_ref(), &msg).unwrap();
            let (decoded, _) = decode_frame(codec.as_ref(), &frame).unwrap();
            match decoded {
                Frame::Call { args, .. } => {
                    assert_eq!(args[1], Value::Int(1));
                    assert_eq!(args[2], Value::Float(1.0));
                    assert_eq!(args[0], nested_value());
                }
                other => panic!("expected call, got {}", other.kind()),
            }
        }
    }

    #[test]
    fn random_floats_are_bit_exact_under_both_codecs() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let floats: Vec<f64> = (0..2000)
            .map(|_| f64::from_bits(rng.gen::<u64>()))
            .filter(|f| f.is_finite())
            .chain([0.1, -0.0, f64::MIN_POSITIVE, f64::MAX, 5e-324])
            .collect();
        let msg = Frame::Result {
            id: 3,
            outcome: Outcome::Values(floats.iter().copied().map(Value::Float).collect()),
        };
        for codec in [CodecKind::Bincode.codec(), CodecKind::Json.codec()] {
            let frame = encode_frame(codec.as_ref(), &msg).unwrap();
            let (decoded, _) = decode_frame(codec.as_ref(), &frame).unwrap();
            let Frame::Result {
                outcome: Outcome::Values(values),
                ..
            } = decoded
            else {
                panic!("expected values");
            };
            assert_eq!(values.len(), floats.len());
            for (got, want) in values.iter().zip(&floats) {
                match got {
                    Value::Float(f) => assert_eq!(f.to_bits(), want.to_bits()),
                    other => panic!("float came back as {other:?}"),
                }
            }
        }
    }

    #[test]
    fn json_refuses_non_finite_floats_bincode_keeps_them() {
        let mut map = BTreeMap::new();
        map.insert("x".to_string(), Value::Float(f64::NAN));
        for bad in [
            Value::Float(f64::NAN),
            Value::Float(f64::NEG_INFINITY),
            Value::List(vec![Value::Int(1), Value::Map(map)]),
        ] {
            let msg = Frame::Call {
                id: 1,
                method: "echo".into(),
                args: vec![bad.clone()],
            };
            assert!(matches!(
                encode_frame(&JsonCodec, &msg),
                Err(FrameEncodeError::NonFinite)
            ));
            let chunk = Frame::Chunk {
                channel: ChannelRef {
                    id: 2,
                    owner: Owner::Sender,
                },
                seq: 0,
                payload: bad,
            };
            assert!(matches!(
                encode_frame(&JsonCodec, &chunk),
                Err(FrameEncodeError::NonFinite)
            ));
        }

        let msg = Frame::Call {
            id: 1,
            method: "echo".into(),
            args: vec![Value::Float(f64::INFINITY), Value::Float(f64::NAN)],
        };
        let frame = encode_frame(&BincodeCodec, &msg).unwrap();
        match decode_frame(&BincodeCodec, &frame).unwrap().0 {
            Frame::Call { args, .. } => {
                assert_eq!(args[0], Value::Float(f64::INFINITY));
                assert!(matches!(args[1], Value::Float(f) if f.is_nan()));
            }
            other => panic!("expected call, got {}", other.kind()),
        }
    }

    #[test]
    fn oversized_payload_refused_on_encode() {
        let msg = Frame::Call {
            id: 1,
            method: "echo".into(),
            args: vec![Value::Bytes(vec![0; MAX_FRAME_LEN as usize + 1])],
        };
        assert!(matches!(
            encode_frame(&BincodeCodec, &msg),
            Err(FrameEncodeError::TooLarge)
        ));
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&BincodeCodec, &sample_registry()).unwrap();
        assert!(matches!(
            decode_frame(&BincodeCodec, &frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&BincodeCodec, &frame[..LEN_SIZE + 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_prefix_rejected() {
        let bytes = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(
            decode_frame(&BincodeCodec, &bytes),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn garbage_body_is_malformed_not_fatal() {
        let mut bytes = 3u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xff, 0xff, 0xff]);
        let err = decode_frame(&BincodeCodec, &bytes).unwrap_err();
        assert!(err.is_malformed_body());
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let a = sample_registry();
        let b = Frame::Chunk {
            channel: ChannelRef {
                id: 4,
                owner: Owner::Sender,
            },
            seq: 0,
            payload: Value::Str("line\n".into()),
        };
        let fa = encode_frame(&BincodeCodec, &a).unwrap();
        let fb = encode_frame(&BincodeCodec, &b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&BincodeCodec, &buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&BincodeCodec, &buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert!(matches!(m1, Frame::Registry { .. }));
        assert_eq!(m2, b);
    }

    #[test]
    fn codec_kind_parses() {
        assert_eq!("JSON".parse::<CodecKind>().unwrap(), CodecKind::Json);
        assert_eq!("bincode".parse::<CodecKind>().unwrap(), CodecKind::Bincode);
        assert!("xml".parse::<CodecKind>().is_err());
    }

    #[test]
    fn random_binary_chunks_survive_arbitrary_splits() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let mut stream = Vec::new();
        let mut sent = Vec::new();
        for seq in 0..20u64 {
            let len = rng.gen_range(0..4096);
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let msg = Frame::Chunk {
                channel: ChannelRef {
                    id: 1,
                    owner: Owner::Receiver,
                },
                seq,
                payload: Value::Bytes(payload),
            };
            stream.extend_from_slice(&encode_frame(&BincodeCodec, &msg).unwrap());
            sent.push(msg);
        }

        // Feed the byte stream in random-sized pieces, as a socket would.
        let mut buf = Vec::new();
        let mut received = Vec::new();
        let mut pos = 0;
        while pos < stream.len() {
            let step = rng.gen_range(1..=700).min(stream.len() - pos);
            buf.extend_from_slice(&stream[pos..pos + step]);
            pos += step;
            loop {
                match decode_frame(&BincodeCodec, &buf) {
                    Ok((msg, n)) => {
                        received.push(msg);
                        buf.drain(..n);
                    }
                    Err(FrameDecodeError::NeedMore) => break,
                    Err(e) => panic!("unexpected decode error: {e}"),
                }
            }
        }
        assert!(buf.is_empty());
        assert_eq!(received, sent);
    }
}
