//! NBD wire protocol constants and record layouts.
//!
//! Implements the parts of the protocol the client and server need, as
//! specified in
//! <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>

use bytes::{Buf, BufMut, BytesMut};

use crate::NbdError;

pub const NBD_INIT_MAGIC: u64 = 0x4e42444d41474943; // "NBDMAGIC"
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454f5054; // "IHAVEOPT"
pub const NBD_REP_MAGIC: u64 = 0x0003e889045565a9;
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
pub const NBD_STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;

// handshake flags (server), mirrored as client flags
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;
pub const NBD_CFLAG_FIXED_NEWSTYLE: u32 = 1 << 0;
pub const NBD_CFLAG_NO_ZEROES: u32 = 1 << 1;

// transmission flags
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_WRITE_ZEROES: u16 = 1 << 6;
pub const NBD_FLAG_CAN_MULTI_CONN: u16 = 1 << 8;

// option codes
pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_GO: u32 = 7;
pub const NBD_OPT_STRUCTURED_REPLY: u32 = 8;
pub const NBD_OPT_SET_META_CONTEXT: u32 = 10;

// option reply types
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_INFO: u32 = 3;
pub const NBD_REP_META_CONTEXT: u32 = 4;
pub const NBD_REP_FLAG_ERROR: u32 = 1 << 31;
pub const NBD_REP_ERR_UNSUP: u32 = NBD_REP_FLAG_ERROR | 1;
pub const NBD_REP_ERR_UNKNOWN: u32 = NBD_REP_FLAG_ERROR | 6;

// info types carried in NBD_REP_INFO
pub const NBD_INFO_EXPORT: u16 = 0;
pub const NBD_INFO_BLOCK_SIZE: u16 = 3;

// transmission commands
pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISC: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;
pub const NBD_CMD_WRITE_ZEROES: u16 = 6;
pub const NBD_CMD_BLOCK_STATUS: u16 = 7;

// structured reply chunk types
pub const NBD_REPLY_TYPE_NONE: u16 = 0;
pub const NBD_REPLY_TYPE_OFFSET_DATA: u16 = 1;
pub const NBD_REPLY_TYPE_OFFSET_HOLE: u16 = 2;
pub const NBD_REPLY_TYPE_BLOCK_STATUS: u16 = 5;
pub const NBD_REPLY_FLAG_DONE: u16 = 1 << 0;
pub const NBD_REPLY_TYPE_FLAG_ERROR: u16 = 1 << 15;

// errno values used in replies
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOSPC: u32 = 28;

/// Fixed-size transmission request record (28 bytes on the wire).
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub flags: u16,
    pub command: u16,
    pub cookie: u64,
    pub offset: u64,
    pub length: u32,
}

impl Request {
    pub const SIZE: usize = 28;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32(NBD_REQUEST_MAGIC);
        buf.put_u16(self.flags);
        buf.put_u16(self.command);
        buf.put_u64(self.cookie);
        buf.put_u64(self.offset);
        buf.put_u32(self.length);
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(&buf);
        out
    }

    pub fn parse(data: &[u8; Self::SIZE]) -> Result<Self, NbdError> {
        let mut buf = &data[..];
        let magic = buf.get_u32();
        if magic != NBD_REQUEST_MAGIC {
            return Err(NbdError::Protocol(format!(
                "bad request magic {:08x}",
                magic
            )));
        }
        Ok(Request {
            flags: buf.get_u16(),
            command: buf.get_u16(),
            cookie: buf.get_u64(),
            offset: buf.get_u64(),
            length: buf.get_u32(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_record_roundtrip() {
        let req = Request {
            flags: 0,
            command: NBD_CMD_READ,
            cookie: 42,
            offset: 0x10000,
            length: 4096,
        };
        let raw = req.encode();
        let parsed = Request::parse(&raw).unwrap();
        assert_eq!(parsed.command, NBD_CMD_READ);
        assert_eq!(parsed.cookie, 42);
        assert_eq!(parsed.offset, 0x10000);
        assert_eq!(parsed.length, 4096);
    }
}
