//! Table slice wire format (spec §6.3): how a slice, a checkpoint barrier,
//! end-of-stream, or a diagnostic is framed for transport between processes
//! (e.g. to a `location_hint = remote` operator instance). In-process
//! operators exchange [`crate::message::Message`] directly and never touch
//! this module; it only matters once a stream crosses a process boundary.
//!
//! Framing is a fixed four-field header followed by the payload:
//! `{u16 kind, u16 flags, u32 payload_len, payload[payload_len]}`. A slice's
//! payload is a one-record-batch Arrow IPC stream; every other kind's
//! payload is a small fixed or self-describing blob (§6.4 JSON for
//! diagnostics, a bare u64 for a barrier's checkpoint id, empty for
//! end-of-stream).

use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use datafusion::arrow::ipc::reader::StreamReader;
use datafusion::arrow::ipc::writer::StreamWriter;

use crate::diagnostics::Diagnostic;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::message::CheckpointId;
use crate::slice::TableSlice;

/// The four-byte-header length: `u16 kind + u16 flags + u32 payload_len`.
pub const HEADER_LEN: usize = 8;

/// The `kind` discriminant of a frame (spec §6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Slice,
    CheckpointBarrier,
    EndOfStream,
    Diagnostic,
}

impl FrameKind {
    fn tag(self) -> u16 {
        match self {
            FrameKind::Slice => 0,
            FrameKind::CheckpointBarrier => 1,
            FrameKind::EndOfStream => 2,
            FrameKind::Diagnostic => 3,
        }
    }

    fn from_tag(tag: u16) -> Result<Self> {
        match tag {
            0 => Ok(FrameKind::Slice),
            1 => Ok(FrameKind::CheckpointBarrier),
            2 => Ok(FrameKind::EndOfStream),
            3 => Ok(FrameKind::Diagnostic),
            other => Err(PipelineError::new(
                ErrorKind::Parse,
                format!("unknown wire frame kind `{other}`"),
            )),
        }
    }
}

/// A decoded frame header plus its payload bytes, before the payload is
/// interpreted according to `kind`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub flags: u16,
    pub payload: Bytes,
}

/// Writes one frame (header + payload) to `out`.
fn write_frame(out: &mut BytesMut, kind: FrameKind, flags: u16, payload: &[u8]) -> Result<()> {
    let payload_len: u32 = payload.len().try_into().map_err(|_| {
        PipelineError::new(ErrorKind::ResourceExhausted, "frame payload exceeds u32::MAX bytes")
    })?;
    out.put_u16(kind.tag());
    out.put_u16(flags);
    out.put_u32(payload_len);
    out.put_slice(payload);
    Ok(())
}

/// Reads exactly one frame from the front of `buf`, advancing past it.
/// Returns `None` if `buf` doesn't yet hold a complete header.
pub fn read_frame(buf: &mut Bytes) -> Result<Option<Frame>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut header = buf.slice(0..HEADER_LEN);
    let kind = FrameKind::from_tag(header.get_u16())?;
    let flags = header.get_u16();
    let payload_len = header.get_u32() as usize;
    if buf.len() < HEADER_LEN + payload_len {
        return Ok(None);
    }
    buf.advance(HEADER_LEN);
    let payload = buf.split_to(payload_len);
    Ok(Some(Frame { kind, flags, payload }))
}

/// Encodes a [`TableSlice`] as a `kind = 0` frame: its single record batch
/// serialized as an Arrow IPC stream.
pub fn encode_slice(slice: &TableSlice) -> Result<Bytes> {
    let mut ipc_bytes = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut ipc_bytes, &slice.schema())
            .map_err(|e| PipelineError::with_source(ErrorKind::Io, "failed to open IPC stream writer", e.into()))?;
        writer
            .write(slice.batch())
            .map_err(|e| PipelineError::with_source(ErrorKind::Io, "failed to write IPC record batch", e.into()))?;
        writer
            .finish()
            .map_err(|e| PipelineError::with_source(ErrorKind::Io, "failed to finish IPC stream", e.into()))?;
    }
    let mut out = BytesMut::with_capacity(HEADER_LEN + ipc_bytes.len());
    write_frame(&mut out, FrameKind::Slice, 0, &ipc_bytes)?;
    Ok(out.freeze())
}

/// Decodes a `kind = 0` frame's payload back into a [`TableSlice`]. The
/// slice's `import_time`/`offset` metadata travels alongside the frame out
/// of band (they are pipeline bookkeeping, not part of the Arrow schema);
/// callers that need them attach them after decoding.
pub fn decode_slice(payload: &[u8]) -> Result<TableSlice> {
    let mut reader = StreamReader::try_new(Cursor::new(payload), None)
        .map_err(|e| PipelineError::with_source(ErrorKind::Parse, "failed to open IPC stream reader", e.into()))?;
    let batch = reader
        .next()
        .ok_or_else(|| PipelineError::new(ErrorKind::Parse, "IPC stream contained no record batch"))?
        .map_err(|e| PipelineError::with_source(ErrorKind::Parse, "failed to read IPC record batch", e.into()))?;
    Ok(TableSlice::from_batch(batch))
}

/// Encodes a checkpoint barrier as a `kind = 1` frame: an 8-byte big-endian
/// checkpoint id payload.
pub fn encode_barrier(id: CheckpointId) -> Result<Bytes> {
    let mut out = BytesMut::with_capacity(HEADER_LEN + 8);
    write_frame(&mut out, FrameKind::CheckpointBarrier, 0, &id.0.to_be_bytes())?;
    Ok(out.freeze())
}

pub fn decode_barrier(payload: &[u8]) -> Result<CheckpointId> {
    let bytes: [u8; 8] = payload
        .try_into()
        .map_err(|_| PipelineError::new(ErrorKind::Parse, "checkpoint barrier payload must be 8 bytes"))?;
    Ok(CheckpointId(u64::from_be_bytes(bytes)))
}

/// Encodes end-of-stream as a `kind = 2` frame with an empty payload.
pub fn encode_end_of_stream() -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN);
    write_frame(&mut out, FrameKind::EndOfStream, 0, &[]).expect("empty payload never overflows u32");
    out.freeze()
}

/// Encodes a diagnostic as a `kind = 3` frame: its §6.4 JSON object, UTF-8
/// encoded.
pub fn encode_diagnostic(diagnostic: &Diagnostic) -> Result<Bytes> {
    let json = serde_json::to_vec(diagnostic)
        .map_err(|e| PipelineError::with_source(ErrorKind::Io, "failed to serialize diagnostic", e.into()))?;
    let mut out = BytesMut::with_capacity(HEADER_LEN + json.len());
    write_frame(&mut out, FrameKind::Diagnostic, 0, &json)?;
    Ok(out.freeze())
}

pub fn decode_diagnostic(payload: &[u8]) -> Result<Diagnostic> {
    serde_json::from_slice(payload)
        .map_err(|e| PipelineError::with_source(ErrorKind::Parse, "failed to deserialize diagnostic", e.into()))
}

/// Appends newly received bytes to a partially filled frame buffer, for a
/// caller accumulating chunks off a real socket or pipe before each
/// `read_frame` call.
pub fn append(buf: &Bytes, chunk: &[u8]) -> Bytes {
    let mut merged = BytesMut::with_capacity(buf.len() + chunk.len());
    merged.put_slice(buf);
    merged.put_slice(chunk);
    merged.freeze()
}
