use crc32c::crc32c;
use std::io::{self, Read, Write};
use thiserror::Error;

pub const MAX_FRAME_BODY_BYTES: usize = 64 * 1024 * 1024;

/// One commit-log record: a table id plus an opaque payload, protected by a
/// crc32c over the length header and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_length: u32,
    pub table_id: [u8; 16],
    pub timestamp_micros: u64,
    pub payload_type: u8,
    pub payload: Vec<u8>,
    pub crc32c: u32,
}

pub const PAYLOAD_MUTATION: u8 = 0x01;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("truncated frame")]
    Truncation,
    #[error("corrupt frame")]
    Corruption,
    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for FrameError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn append(
        &mut self,
        table_id: [u8; 16],
        timestamp_micros: u64,
        payload_type: u8,
        payload: &[u8],
    ) -> Result<usize, FrameError> {
        let body_len = 16 + 8 + 1 + payload.len() + 4;
        let frame_length = u32::try_from(body_len).map_err(|_| FrameError::Corruption)?;
        if body_len > MAX_FRAME_BODY_BYTES {
            return Err(FrameError::Corruption);
        }
        let len_bytes = frame_length.to_be_bytes();
        let ts_bytes = timestamp_micros.to_be_bytes();
        let type_bytes = [payload_type];

        let mut crc_input = Vec::with_capacity(4 + body_len - 4);
        crc_input.extend_from_slice(&len_bytes);
        crc_input.extend_from_slice(&table_id);
        crc_input.extend_from_slice(&ts_bytes);
        crc_input.extend_from_slice(&type_bytes);
        crc_input.extend_from_slice(payload);
        let crc = crc32c(&crc_input).to_be_bytes();

        self.inner.write_all(&len_bytes)?;
        self.inner.write_all(&table_id)?;
        self.inner.write_all(&ts_bytes)?;
        self.inner.write_all(&type_bytes)?;
        self.inner.write_all(payload)?;
        self.inner.write_all(&crc)?;
        Ok(4 + body_len)
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut len_buf = [0u8; 4];
        let first = self.inner.read(&mut len_buf[0..1])?;
        if first == 0 {
            return Ok(None);
        }
        match self.inner.read_exact(&mut len_buf[1..4]) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::Truncation);
            }
            Err(e) => return Err(FrameError::Io(e.to_string())),
        }
        let frame_length = u32::from_be_bytes(len_buf);
        let body_len = frame_length as usize;
        if body_len < 16 + 8 + 1 + 4 || body_len > MAX_FRAME_BODY_BYTES {
            return Err(FrameError::Corruption);
        }

        let mut body = vec![0u8; body_len];
        match self.inner.read_exact(&mut body) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::Truncation);
            }
            Err(e) => return Err(FrameError::Io(e.to_string())),
        }

        let crc_offset = body_len - 4;
        let stored_crc = u32::from_be_bytes(
            body[crc_offset..]
                .try_into()
                .map_err(|_| FrameError::Corruption)?,
        );
        let mut crc_input = Vec::with_capacity(4 + crc_offset);
        crc_input.extend_from_slice(&len_buf);
        crc_input.extend_from_slice(&body[..crc_offset]);
        if stored_crc != crc32c(&crc_input) {
            return Err(FrameError::Corruption);
        }

        let table_id: [u8; 16] = body[0..16].try_into().map_err(|_| FrameError::Corruption)?;
        let timestamp_micros =
            u64::from_be_bytes(body[16..24].try_into().map_err(|_| FrameError::Corruption)?);
        let payload_type = body[24];
        let payload = body[25..crc_offset].to_vec();

        Ok(Some(Frame {
            frame_length,
            table_id,
            timestamp_micros,
            payload_type,
            payload,
            crc32c: stored_crc,
        }))
    }
}
