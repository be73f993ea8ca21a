use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frames longer than this close the connection - a peer sending a bigger length prefix
///  is broken or hostile.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// One message = u32 length prefix (big endian, length *after* the prefix) + payload.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Incremental frame reassembly from a byte stream: chunks go in as they arrive off the
///  socket, complete frames come out. One assembler per connection.
pub struct FrameAssembler {
    buf: BytesMut,
    max_message_size: usize,
}

impl FrameAssembler {
    pub fn new(max_message_size: usize) -> FrameAssembler {
        FrameAssembler {
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The next complete frame, or `None` if more bytes are needed. An oversized length
    ///  prefix is an error; the caller is expected to drop the connection.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if frame_len > self.max_message_size {
            bail!(
                "frame length {} exceeds the maximum of {} - closing connection because it is apparently compromised",
                frame_len,
                self.max_message_size
            );
        }
        if self.buf.len() < 4 + frame_len {
            return Ok(None);
        }
        self.buf.advance(4);
        Ok(Some(self.buf.split_to(frame_len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::single_chunk(vec![vec![0, 0, 0, 3, 1, 2, 3]], vec![vec![1, 2, 3]])]
    #[case::split_inside_prefix(vec![vec![0, 0], vec![0, 3, 1, 2, 3]], vec![vec![1, 2, 3]])]
    #[case::split_inside_payload(vec![vec![0, 0, 0, 3, 1], vec![2, 3]], vec![vec![1, 2, 3]])]
    #[case::two_frames_one_chunk(
        vec![vec![0, 0, 0, 1, 9, 0, 0, 0, 2, 7, 8]],
        vec![vec![9], vec![7, 8]]
    )]
    #[case::empty_frame(vec![vec![0, 0, 0, 0]], vec![vec![]])]
    fn test_reassembly(#[case] chunks: Vec<Vec<u8>>, #[case] expected: Vec<Vec<u8>>) {
        let mut assembler = FrameAssembler::new(MAX_MESSAGE_SIZE);
        let mut frames = Vec::new();
        for chunk in chunks {
            assembler.push(&chunk);
            while let Some(frame) = assembler.next_frame().unwrap() {
                frames.push(frame.to_vec());
            }
        }
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut assembler = FrameAssembler::new(16);
        assembler.push(&[0, 0, 0, 17]);
        assert!(assembler.next_frame().is_err());
    }

    #[test]
    fn test_encode_matches_assembler() {
        let mut assembler = FrameAssembler::new(MAX_MESSAGE_SIZE);
        assembler.push(&encode_frame(b"hello"));
        assert_eq!(assembler.next_frame().unwrap().unwrap().as_ref(), b"hello");
    }
}
