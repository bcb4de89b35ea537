use crate::protocol::{Frame, MAX_STREAM_FRAME, PacketError};

pub const LENGTH_PREFIX: usize = 4;

/// Encodes `frame` behind a big-endian `u32` length prefix.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, PacketError> {
    let body = frame.serialize()?;
    if body.len() > MAX_STREAM_FRAME {
        return Err(PacketError::TooLarge {
            size: body.len(),
            limit: MAX_STREAM_FRAME,
        });
    }

    let mut out = Vec::with_capacity(LENGTH_PREFIX + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Reassembles length-prefixed frames from arbitrary stream chunks.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete frame and its size on the wire, `Ok(None)` until one
    /// has fully arrived.
    ///
    /// A body that fails to decode is consumed, so the stream stays in sync.
    /// An oversized length prefix is returned as `TooLarge` and leaves the
    /// reader unusable.
    pub fn next_frame(&mut self) -> Result<Option<(Frame, usize)>, PacketError> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX]);
        let length = u32::from_be_bytes(prefix) as usize;
        if length > MAX_STREAM_FRAME {
            return Err(PacketError::TooLarge {
                size: length,
                limit: MAX_STREAM_FRAME,
            });
        }

        let total = LENGTH_PREFIX + length;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame = Frame::deserialize(&self.buffer[LENGTH_PREFIX..total]);
        self.buffer.drain(..total);
        frame.map(|frame| Some((frame, total)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PayloadFrame;
    use crate::state::DisconnectReason;

    #[test]
    fn test_frames_split_across_chunks() {
        let first = encode_frame(&Frame::Heartbeat).unwrap();
        let second = encode_frame(&Frame::Disconnect {
            reason: DisconnectReason::UserRequested,
        })
        .unwrap();
        let mut stream: Vec<u8> = first.clone();
        stream.extend_from_slice(&second);

        let mut reader = FrameReader::new();
        let mut frames = Vec::new();
        for chunk in stream.chunks(3) {
            reader.push(chunk);
            while let Some((frame, size)) = reader.next_frame().unwrap() {
                frames.push((frame, size));
            }
        }

        assert_eq!(
            frames,
            vec![
                (Frame::Heartbeat, first.len()),
                (
                    Frame::Disconnect {
                        reason: DisconnectReason::UserRequested
                    },
                    second.len()
                ),
            ]
        );
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        let mut reader = FrameReader::new();
        reader.push(&((MAX_STREAM_FRAME as u32) + 1).to_be_bytes());

        assert!(matches!(
            reader.next_frame(),
            Err(PacketError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_oversized_frame_not_encoded() {
        let frame = Frame::Payload(PayloadFrame {
            reliable_sequence: None,
            packet_type: 1,
            payload: vec![0; MAX_STREAM_FRAME + 1],
        });

        assert!(matches!(
            encode_frame(&frame),
            Err(PacketError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_garbage_body_is_skipped() {
        let mut reader = FrameReader::new();
        reader.push(&3u32.to_be_bytes());
        reader.push(&[0xff, 0xff, 0xff]);
        reader.push(&encode_frame(&Frame::Heartbeat).unwrap());

        assert!(reader.next_frame().is_err());
        assert_eq!(reader.next_frame().unwrap().map(|(f, _)| f), Some(Frame::Heartbeat));
    }
}
