//! Blocking NBD client over a unix socket.
//!
//! One connection serves one disk with at most one request in flight,
//! which is all the pipelines need: every disk worker owns its
//! connection exclusively. Negotiation is fixed-newstyle with
//! structured replies, plus one optional metadata context
//! (`base:allocation` or `qemu:dirty-bitmap:<name>`) for extent
//! queries.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, warn};

use crate::protocol::*;
use crate::{BlockDevice, NbdError, RawExtent};

/// Request size negotiated when the server does not advertise block
/// size constraints.
pub const DEFAULT_MAX_REQUEST_SIZE: u64 = 4 * 1024 * 1024;

const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct NbdClient {
    stream: UnixStream,
    export: String,
    size: u64,
    transmission_flags: u16,
    max_request_size: u64,
    meta_context_id: Option<u32>,
    next_cookie: u64,
    connected: bool,
}

impl NbdClient {
    /// Connect and negotiate. Retries up to 10 times with one second
    /// pauses while the endpoint is still coming up; all other
    /// failures are immediately fatal.
    pub fn connect(
        socket: &Path,
        export: &str,
        meta_context: Option<&str>,
    ) -> Result<Self, NbdError> {
        let mut attempt = 0;
        let stream = loop {
            attempt += 1;
            match UnixStream::connect(socket) {
                Ok(stream) => break stream,
                // the exporting process may not have created the
                // socket yet
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound
                    ) =>
                {
                    if attempt >= CONNECT_ATTEMPTS {
                        return Err(NbdError::Connect(format!(
                            "{}: {} (gave up after {} attempts)",
                            socket.display(),
                            err,
                            attempt
                        )));
                    }
                    debug!(
                        "NBD endpoint {} not ready ({}), retrying",
                        socket.display(),
                        err
                    );
                    std::thread::sleep(CONNECT_RETRY_DELAY);
                }
                Err(err) => {
                    return Err(NbdError::Connect(format!("{}: {}", socket.display(), err)))
                }
            }
        };

        let mut client = NbdClient {
            stream,
            export: export.to_string(),
            size: 0,
            transmission_flags: 0,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            meta_context_id: None,
            next_cookie: 1,
            connected: false,
        };
        client.handshake(meta_context)?;
        client.connected = true;
        Ok(client)
    }

    fn handshake(&mut self, meta_context: Option<&str>) -> Result<(), NbdError> {
        let init = self.read_u64()?;
        if init != NBD_INIT_MAGIC {
            return Err(NbdError::Protocol(format!("bad init magic {:016x}", init)));
        }
        let opts = self.read_u64()?;
        if opts != NBD_OPTS_MAGIC {
            return Err(NbdError::Protocol("server is not fixed-newstyle".into()));
        }
        let handshake_flags = self.read_u16()?;
        if handshake_flags & NBD_FLAG_FIXED_NEWSTYLE == 0 {
            return Err(NbdError::Protocol(
                "server does not support fixed-newstyle negotiation".into(),
            ));
        }

        let mut client_flags = NBD_CFLAG_FIXED_NEWSTYLE;
        if handshake_flags & NBD_FLAG_NO_ZEROES != 0 {
            client_flags |= NBD_CFLAG_NO_ZEROES;
        }
        self.stream.write_all(&client_flags.to_be_bytes())?;

        // structured replies are required for block status queries
        self.send_option(NBD_OPT_STRUCTURED_REPLY, &[])?;
        let (reply, _) = self.read_option_reply(NBD_OPT_STRUCTURED_REPLY)?;
        match reply {
            NBD_REP_ACK => {}
            NBD_REP_ERR_UNSUP if meta_context.is_none() => {
                warn!("server does not support structured replies");
            }
            NBD_REP_ERR_UNSUP => {
                return Err(NbdError::Protocol(
                    "server does not support structured replies, unable to query extents".into(),
                ))
            }
            other => {
                return Err(NbdError::Protocol(format!(
                    "unexpected reply {:08x} to structured reply option",
                    other
                )))
            }
        }

        if let Some(context) = meta_context {
            self.negotiate_meta_context(context)?;
        }

        self.negotiate_go()?;
        Ok(())
    }

    fn negotiate_meta_context(&mut self, context: &str) -> Result<(), NbdError> {
        let mut data = BytesMut::new();
        data.put_u32(self.export.len() as u32);
        data.put_slice(self.export.as_bytes());
        data.put_u32(1);
        data.put_u32(context.len() as u32);
        data.put_slice(context.as_bytes());
        self.send_option(NBD_OPT_SET_META_CONTEXT, &data)?;

        loop {
            let (reply, payload) = self.read_option_reply(NBD_OPT_SET_META_CONTEXT)?;
            match reply {
                NBD_REP_META_CONTEXT => {
                    if payload.len() < 4 {
                        return Err(NbdError::Protocol("short meta context reply".into()));
                    }
                    let mut buf = &payload[..];
                    let id = buf.get_u32();
                    let name = String::from_utf8_lossy(buf).to_string();
                    debug!("negotiated meta context '{}' (id {})", name, id);
                    self.meta_context_id = Some(id);
                }
                NBD_REP_ACK => break,
                other => {
                    return Err(NbdError::Protocol(format!(
                        "meta context '{}' rejected (reply {:08x})",
                        context, other
                    )))
                }
            }
        }

        if self.meta_context_id.is_none() {
            return Err(NbdError::Protocol(format!(
                "server does not provide meta context '{}'",
                context
            )));
        }
        Ok(())
    }

    fn negotiate_go(&mut self) -> Result<(), NbdError> {
        let mut data = BytesMut::new();
        data.put_u32(self.export.len() as u32);
        data.put_slice(self.export.as_bytes());
        data.put_u16(1);
        data.put_u16(NBD_INFO_BLOCK_SIZE);
        self.send_option(NBD_OPT_GO, &data)?;

        let mut have_export_info = false;
        loop {
            let (reply, payload) = self.read_option_reply(NBD_OPT_GO)?;
            match reply {
                NBD_REP_INFO => {
                    if payload.len() < 2 {
                        return Err(NbdError::Protocol("short info reply".into()));
                    }
                    let mut buf = &payload[..];
                    match buf.get_u16() {
                        NBD_INFO_EXPORT if buf.remaining() >= 10 => {
                            self.size = buf.get_u64();
                            self.transmission_flags = buf.get_u16();
                            have_export_info = true;
                        }
                        NBD_INFO_BLOCK_SIZE if buf.remaining() >= 12 => {
                            let _min = buf.get_u32();
                            let _preferred = buf.get_u32();
                            let max = buf.get_u32();
                            if max > 0 {
                                self.max_request_size = max as u64;
                            }
                        }
                        _ => {} // unknown info items are ignored
                    }
                }
                NBD_REP_ACK => break,
                NBD_REP_ERR_UNKNOWN => {
                    return Err(NbdError::Protocol(format!(
                        "export '{}' unknown to server",
                        self.export
                    )))
                }
                other => {
                    let message = String::from_utf8_lossy(&payload).to_string();
                    return Err(NbdError::Protocol(format!(
                        "option go failed (reply {:08x}): {}",
                        other, message
                    )));
                }
            }
        }

        if !have_export_info {
            return Err(NbdError::Protocol("server sent no export info".into()));
        }
        debug!(
            "connected to export '{}': size {}, max request size {}",
            self.export, self.size, self.max_request_size
        );
        Ok(())
    }

    fn send_option(&mut self, option: u32, data: &[u8]) -> Result<(), NbdError> {
        let mut buf = BytesMut::with_capacity(16 + data.len());
        buf.put_u64(NBD_OPTS_MAGIC);
        buf.put_u32(option);
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
        self.stream.write_all(&buf)?;
        Ok(())
    }

    fn read_option_reply(&mut self, expect: u32) -> Result<(u32, Vec<u8>), NbdError> {
        let magic = self.read_u64()?;
        if magic != NBD_REP_MAGIC {
            return Err(NbdError::Protocol(format!(
                "bad option reply magic {:016x}",
                magic
            )));
        }
        let option = self.read_u32()?;
        if option != expect {
            return Err(NbdError::Protocol(format!(
                "reply for option {} while expecting {}",
                option, expect
            )));
        }
        let reply = self.read_u32()?;
        let length = self.read_u32()? as usize;
        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload)?;
        Ok((reply, payload))
    }

    fn send_request(
        &mut self,
        command: u16,
        flags: u16,
        offset: u64,
        length: u32,
    ) -> Result<u64, NbdError> {
        let cookie = self.next_cookie;
        self.next_cookie += 1;
        let request = Request {
            flags,
            command,
            cookie,
            offset,
            length,
        };
        self.stream.write_all(&request.encode())?;
        Ok(cookie)
    }

    /// Read one reply, simple or structured. Calls `chunk` for every
    /// structured non-error chunk; returns after a simple reply or the
    /// final chunk.
    fn read_reply<F>(
        &mut self,
        command: &'static str,
        cookie: u64,
        mut chunk: F,
    ) -> Result<(), NbdError>
    where
        F: FnMut(&mut UnixStream, u16, u32) -> Result<(), NbdError>,
    {
        loop {
            let magic = self.read_u32()?;
            match magic {
                NBD_SIMPLE_REPLY_MAGIC => {
                    let errno = self.read_u32()?;
                    let reply_cookie = self.read_u64()?;
                    if reply_cookie != cookie {
                        return Err(NbdError::Protocol(format!(
                            "reply cookie mismatch ({} != {})",
                            reply_cookie, cookie
                        )));
                    }
                    if errno != 0 {
                        return Err(NbdError::Command { command, errno });
                    }
                    // simple replies to reads carry the payload
                    chunk(&mut self.stream, u16::MAX, 0)?;
                    return Ok(());
                }
                NBD_STRUCTURED_REPLY_MAGIC => {
                    let flags = self.read_u16()?;
                    let chunk_type = self.read_u16()?;
                    let reply_cookie = self.read_u64()?;
                    let length = self.read_u32()?;
                    if reply_cookie != cookie {
                        return Err(NbdError::Protocol(format!(
                            "reply cookie mismatch ({} != {})",
                            reply_cookie, cookie
                        )));
                    }
                    if chunk_type & NBD_REPLY_TYPE_FLAG_ERROR != 0 {
                        if length < 6 {
                            return Err(NbdError::Protocol("short error chunk".into()));
                        }
                        let errno = self.read_u32()?;
                        let msg_len = self.read_u16()? as usize;
                        let mut rest = vec![0u8; length as usize - 6];
                        self.stream.read_exact(&mut rest)?;
                        let message = String::from_utf8_lossy(&rest[..msg_len.min(rest.len())]);
                        warn!("{} failed: {} (errno {})", command, message, errno);
                        return Err(NbdError::Command { command, errno });
                    }
                    if chunk_type != NBD_REPLY_TYPE_NONE {
                        chunk(&mut self.stream, chunk_type, length)?;
                    }
                    if flags & NBD_REPLY_FLAG_DONE != 0 {
                        return Ok(());
                    }
                }
                other => {
                    return Err(NbdError::Protocol(format!(
                        "bad reply magic {:08x}",
                        other
                    )))
                }
            }
        }
    }

    /// Orderly shutdown of the transmission phase.
    pub fn disconnect(&mut self) -> Result<(), NbdError> {
        if self.connected {
            self.connected = false;
            self.send_request(NBD_CMD_DISC, 0, 0, 0)?;
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
        }
        Ok(())
    }

    fn read_u16(&mut self) -> Result<u16, NbdError> {
        let mut buf = [0u8; 2];
        self.stream.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_u32(&mut self) -> Result<u32, NbdError> {
        let mut buf = [0u8; 4];
        self.stream.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_u64(&mut self) -> Result<u64, NbdError> {
        let mut buf = [0u8; 8];
        self.stream.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }
}

impl BlockDevice for NbdClient {
    fn size(&self) -> u64 {
        self.size
    }

    fn max_request_size(&self) -> u64 {
        self.max_request_size
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), NbdError> {
        let cookie = self.send_request(NBD_CMD_READ, 0, offset, buf.len() as u32)?;
        let expected = buf.len();
        let base = offset;
        self.read_reply("read", cookie, |stream, chunk_type, length| {
            match chunk_type {
                // simple reply: payload is the whole requested range
                u16::MAX => stream.read_exact(&mut buf[..expected]).map_err(Into::into),
                NBD_REPLY_TYPE_OFFSET_DATA => {
                    let mut head = [0u8; 8];
                    stream.read_exact(&mut head)?;
                    let chunk_offset = u64::from_be_bytes(head);
                    let data_len = length as usize - 8;
                    let begin = (chunk_offset - base) as usize;
                    if begin + data_len > expected {
                        return Err(NbdError::Protocol("read chunk out of range".into()));
                    }
                    stream
                        .read_exact(&mut buf[begin..begin + data_len])
                        .map_err(Into::into)
                }
                NBD_REPLY_TYPE_OFFSET_HOLE => {
                    let mut head = [0u8; 12];
                    stream.read_exact(&mut head)?;
                    let chunk_offset = u64::from_be_bytes(head[0..8].try_into().unwrap());
                    let hole_len =
                        u32::from_be_bytes(head[8..12].try_into().unwrap()) as usize;
                    let begin = (chunk_offset - base) as usize;
                    if begin + hole_len > expected {
                        return Err(NbdError::Protocol("hole chunk out of range".into()));
                    }
                    buf[begin..begin + hole_len].fill(0);
                    Ok(())
                }
                other => Err(NbdError::Protocol(format!(
                    "unexpected chunk type {} in read reply",
                    other
                ))),
            }
        })
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<(), NbdError> {
        let cookie = self.send_request(NBD_CMD_WRITE, 0, offset, buf.len() as u32)?;
        self.stream.write_all(buf)?;
        self.read_reply("write", cookie, |_, _, _| Ok(()))
    }

    fn write_zeroes(&mut self, offset: u64, length: u64) -> Result<(), NbdError> {
        if length > u32::MAX as u64 {
            return Err(NbdError::Protocol(
                "write_zeroes request exceeds wire limit, caller must chunk".into(),
            ));
        }
        let cookie = self.send_request(NBD_CMD_WRITE_ZEROES, 0, offset, length as u32)?;
        self.read_reply("write_zeroes", cookie, |_, _, _| Ok(()))
    }

    fn extents(&mut self) -> Result<Vec<RawExtent>, NbdError> {
        let context_id = self.meta_context_id.ok_or_else(|| {
            NbdError::Protocol("no meta context negotiated for extent query".into())
        })?;

        let mut extents: Vec<RawExtent> = Vec::new();
        let mut covered = 0u64;
        while covered < self.size {
            let want = (self.size - covered).min(1 << 30) as u32;
            let cookie = self.send_request(NBD_CMD_BLOCK_STATUS, 0, covered, want)?;

            let mut collected = Vec::<RawExtent>::new();
            self.read_reply("block_status", cookie, |stream, chunk_type, length| {
                if chunk_type != NBD_REPLY_TYPE_BLOCK_STATUS {
                    return Err(NbdError::Protocol(format!(
                        "unexpected chunk type {} in block status reply",
                        chunk_type
                    )));
                }
                let mut payload = vec![0u8; length as usize];
                stream.read_exact(&mut payload)?;
                let mut buf = &payload[..];
                let id = buf.get_u32();
                if id != context_id {
                    return Err(NbdError::Protocol(format!(
                        "block status for unknown context {}",
                        id
                    )));
                }
                while buf.remaining() >= 8 {
                    let length = buf.get_u32() as u64;
                    let flags = buf.get_u32();
                    collected.push(RawExtent { length, flags });
                }
                Ok(())
            })?;

            if collected.is_empty() {
                return Err(NbdError::Protocol(
                    "server sent empty block status reply".into(),
                ));
            }
            for extent in collected {
                // the final extent may exceed the queried range
                let length = extent.length.min(self.size - covered);
                if length == 0 {
                    break;
                }
                covered += length;
                match extents.last_mut() {
                    Some(last) if last.flags == extent.flags => last.length += length,
                    _ => extents.push(RawExtent { length, flags: extent.flags }),
                }
            }
        }
        Ok(extents)
    }

    fn flush(&mut self) -> Result<(), NbdError> {
        if self.transmission_flags & NBD_FLAG_SEND_FLUSH == 0 {
            return Ok(());
        }
        let cookie = self.send_request(NBD_CMD_FLUSH, 0, 0, 0)?;
        self.read_reply("flush", cookie, |_, _, _| Ok(()))
    }
}

impl Drop for NbdClient {
    fn drop(&mut self) {
        if let Err(err) = self.disconnect() {
            debug!("NBD disconnect failed: {}", err);
        }
    }
}
