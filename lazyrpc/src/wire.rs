//! The wire format: every message is preceded by a one-byte header length, a [rpc_pb::Frame]
//! carrying the message's size and crc32c, and then the message itself.

use std::io::{ErrorKind, Read, Write};

use buffertk::{stack_pack, v64, Packable, Unpacker};
use zerror_core::ErrorCore;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

// A one-byte varint of the frame size, then the frame: two tags, a 10-byte varint, and a fixed32.
pub const HEADER_MAX_SIZE: usize = 1 + 1 + 10 + 1 + 4;

/////////////////////////////////////////////// send ///////////////////////////////////////////////

/// Frame `msg` and write it whole.
pub fn send_msg<W: Write>(w: &mut W, msg: &[u8]) -> Result<(), rpc_pb::Error> {
    assert!(msg.len() <= rpc_pb::MAX_BODY_SIZE);
    let frame = rpc_pb::Frame::from_buffer(msg);
    let frame_sz: v64 = frame.pack_sz().into();
    let header = stack_pack(frame_sz).pack(frame).to_vec();
    w.write_all(&header)?;
    w.write_all(msg)?;
    w.flush()?;
    Ok(())
}

/////////////////////////////////////////////// recv ///////////////////////////////////////////////

/// Read one framed message.  Returns None on a clean disconnect, i.e. EOF before the first byte.
pub fn recv_msg<R: Read>(r: &mut R) -> Result<Option<Vec<u8>>, rpc_pb::Error> {
    let mut first = [0u8; 1];
    match r.read(&mut first) {
        Ok(0) => {
            return Ok(None);
        }
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::Interrupted => {
            return recv_msg(r);
        }
        Err(err) => {
            return Err(err.into());
        }
    };
    let hdr_sz = first[0] as usize;
    if hdr_sz == 0 || hdr_sz > HEADER_MAX_SIZE - 1 {
        return Err(rpc_pb::Error::SerializationError {
            core: ErrorCore::default(),
            err: prototk::Error::BufferTooShort {
                required: hdr_sz,
                had: HEADER_MAX_SIZE - 1,
            },
            context: "frame header size invalid".to_owned(),
        });
    }
    let mut hdr = vec![0u8; hdr_sz];
    r.read_exact(&mut hdr)?;
    let mut up = Unpacker::new(&hdr);
    let frame: rpc_pb::Frame = up.unpack()?;
    if frame.size > rpc_pb::MAX_BODY_SIZE as u64 {
        return Err(rpc_pb::Error::RequestTooLarge {
            core: ErrorCore::default(),
            size: frame.size,
        });
    }
    let mut msg = vec![0u8; frame.size as usize];
    r.read_exact(&mut msg)?;
    if crc32c::crc32c(&msg) != frame.crc32c {
        return Err(rpc_pb::Error::TransportFailure {
            core: ErrorCore::default(),
            what: "crc32c mismatch".to_owned(),
        });
    }
    Ok(Some(msg))
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
