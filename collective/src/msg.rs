//! Wire frames exchanged inside a process group.
//!
//! Every frame is a u32 kind header plus a u64 payload length, followed by
//! the payload bytes. Control frames carry a JSON-encoded [`Command`]; tensor
//! frames carry raw `f32` data cast with `bytemuck`; barrier frames are empty.

use std::io::{Read, Write};

use crate::error::{CollectiveErr, Result};

type Kind = u32;
type Len = u64;

const KIND_SIZE: usize = size_of::<Kind>();
const LEN_SIZE: usize = size_of::<Len>();

pub(crate) const KIND_CONTROL: Kind = 1;
pub(crate) const KIND_TENSOR: Kind = 2;
pub(crate) const KIND_BARRIER: Kind = 3;

/// Rendezvous handshake commands.
#[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// A peer announces its rank to the coordinator.
    Join { rank: usize },
    /// The coordinator acknowledges a join.
    Welcome { world_size: usize },
}

fn write_header(w: &mut impl Write, kind: Kind, len: usize) -> Result<()> {
    w.write_all(&kind.to_be_bytes())?;
    w.write_all(&(len as Len).to_be_bytes())?;
    Ok(())
}

fn read_header(r: &mut impl Read) -> Result<(Kind, usize)> {
    let mut kind_buf = [0u8; KIND_SIZE];
    let mut len_buf = [0u8; LEN_SIZE];
    r.read_exact(&mut kind_buf)?;
    r.read_exact(&mut len_buf)?;
    Ok((Kind::from_be_bytes(kind_buf), Len::from_be_bytes(len_buf) as usize))
}

pub(crate) fn write_control(w: &mut impl Write, cmd: &Command) -> Result<()> {
    // Handshake commands are tiny, a per-call buffer is fine here.
    let body = serde_json::to_vec(cmd).map_err(std::io::Error::from)?;
    write_header(w, KIND_CONTROL, body.len())?;
    w.write_all(&body)?;
    w.flush()?;
    Ok(())
}

pub(crate) fn read_control(r: &mut impl Read) -> Result<Command> {
    let (kind, len) = read_header(r)?;
    if kind != KIND_CONTROL {
        return Err(CollectiveErr::UnexpectedFrame {
            got: kind,
            expected: "control",
        });
    }

    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    let cmd = serde_json::from_slice(&body).map_err(std::io::Error::from)?;
    Ok(cmd)
}

pub(crate) fn write_tensor(w: &mut impl Write, buf: &[f32]) -> Result<()> {
    let bytes: &[u8] = bytemuck::cast_slice(buf);
    write_header(w, KIND_TENSOR, bytes.len())?;
    w.write_all(bytes)?;
    w.flush()?;
    Ok(())
}

/// Receives a tensor frame directly into `buf`.
///
/// The sender's element count must match `buf` exactly; a mismatch is a
/// protocol violation, not a resizable condition.
pub(crate) fn read_tensor_into(r: &mut impl Read, buf: &mut [f32]) -> Result<()> {
    let (kind, len) = read_header(r)?;
    if kind != KIND_TENSOR {
        return Err(CollectiveErr::UnexpectedFrame {
            got: kind,
            expected: "tensor",
        });
    }

    let expected = size_of_val(buf);
    if len != expected {
        return Err(CollectiveErr::PayloadMismatch {
            got: len / size_of::<f32>(),
            expected: buf.len(),
        });
    }

    r.read_exact(bytemuck::cast_slice_mut(buf))?;
    Ok(())
}

pub(crate) fn write_barrier(w: &mut impl Write) -> Result<()> {
    write_header(w, KIND_BARRIER, 0)?;
    w.flush()?;
    Ok(())
}

pub(crate) fn read_barrier(r: &mut impl Read) -> Result<()> {
    let (kind, len) = read_header(r)?;
    if kind != KIND_BARRIER || len != 0 {
        return Err(CollectiveErr::UnexpectedFrame {
            got: kind,
            expected: "barrier",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn control_roundtrip() {
        let mut wire = Vec::new();
        write_control(&mut wire, &Command::Join { rank: 3 }).unwrap();

        let cmd = read_control(&mut Cursor::new(wire)).unwrap();
        assert_eq!(cmd, Command::Join { rank: 3 });
    }

    #[test]
    fn tensor_roundtrip() {
        let sent = [1.0f32, -2.5, 0.0, f32::MIN_POSITIVE];
        let mut wire = Vec::new();
        write_tensor(&mut wire, &sent).unwrap();

        let mut got = [0.0f32; 4];
        read_tensor_into(&mut Cursor::new(wire), &mut got).unwrap();
        assert_eq!(got, sent);
    }

    #[test]
    fn tensor_length_mismatch_is_fatal() {
        let mut wire = Vec::new();
        write_tensor(&mut wire, &[1.0f32, 2.0]).unwrap();

        let mut got = [0.0f32; 3];
        let err = read_tensor_into(&mut Cursor::new(wire), &mut got).unwrap_err();
        assert!(matches!(
            err,
            CollectiveErr::PayloadMismatch { got: 2, expected: 3 }
        ));
    }

    #[test]
    fn barrier_frame_is_not_a_tensor() {
        let mut wire = Vec::new();
        write_barrier(&mut wire).unwrap();

        let mut got = [0.0f32; 1];
        let err = read_tensor_into(&mut Cursor::new(wire), &mut got).unwrap_err();
        assert!(matches!(err, CollectiveErr::UnexpectedFrame { .. }));
    }
}
