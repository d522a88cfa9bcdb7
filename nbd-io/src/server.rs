//! Minimal read-only NBD server.
//!
//! Serves a single export to any number of clients. Connections are
//! handled by a fixed pool of OS threads; reads against the export are
//! independent, so the handler threads share nothing but the export
//! handle.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use crossbeam_channel::bounded;
use log::{debug, error, info};

use crate::protocol::*;
use crate::NbdError;

/// A read-only export served over NBD.
pub trait Export: Send + Sync + 'static {
    fn name(&self) -> &str;
    /// Advertised device size.
    fn size(&self) -> u64;
    /// `(minimum, preferred, maximum)` request sizes, advertised as
    /// block size constraints during negotiation.
    fn block_sizes(&self) -> (u32, u32, u32);
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), NbdError>;
}

pub struct NbdServer<E: Export> {
    export: Arc<E>,
    threads: usize,
}

impl<E: Export> NbdServer<E> {
    pub fn new(export: E, threads: usize) -> Self {
        Self {
            export: Arc::new(export),
            threads: threads.max(1),
        }
    }

    /// Accept connections until `shutdown` is set. Connection errors
    /// are logged, they never take the server down.
    pub fn serve(&self, listener: TcpListener, shutdown: &AtomicBool) -> Result<(), NbdError> {
        listener.set_nonblocking(true)?;
        let (conn_tx, conn_rx) = bounded::<TcpStream>(self.threads);

        let mut handles = Vec::new();
        for i in 0..self.threads {
            let conn_rx = conn_rx.clone();
            let export = Arc::clone(&self.export);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("nbd-export ({})", i))
                    .spawn(move || {
                        while let Ok(stream) = conn_rx.recv() {
                            let peer = stream
                                .peer_addr()
                                .map(|addr| addr.to_string())
                                .unwrap_or_else(|_| "unknown".to_string());
                            match serve_connection(stream, export.as_ref()) {
                                Ok(()) => debug!("client {} disconnected", peer),
                                Err(err) => error!("client {}: {}", peer, err),
                            }
                        }
                    })?,
            );
        }

        info!(
            "serving export '{}' ({} bytes) with {} handler threads",
            self.export.name(),
            self.export.size(),
            self.threads
        );

        while !shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!("new client {}", addr);
                    stream.set_nodelay(true).ok();
                    if conn_tx.send(stream).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(err) => return Err(err.into()),
            }
        }

        drop(conn_tx);
        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn transmission_flags() -> u16 {
    NBD_FLAG_HAS_FLAGS | NBD_FLAG_READ_ONLY | NBD_FLAG_CAN_MULTI_CONN
}

fn serve_connection<E: Export>(mut stream: TcpStream, export: &E) -> Result<(), NbdError> {
    // fixed-newstyle greeting
    let mut greeting = BytesMut::with_capacity(18);
    greeting.put_u64(NBD_INIT_MAGIC);
    greeting.put_u64(NBD_OPTS_MAGIC);
    greeting.put_u16(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES);
    stream.write_all(&greeting)?;

    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    let client_flags = u32::from_be_bytes(buf);
    if client_flags & NBD_CFLAG_FIXED_NEWSTYLE == 0 {
        return Err(NbdError::Protocol(
            "client does not speak fixed-newstyle".into(),
        ));
    }
    let no_zeroes = client_flags & NBD_CFLAG_NO_ZEROES != 0;

    if negotiate(&mut stream, export, no_zeroes)? {
        transmission(&mut stream, export)?;
    }
    Ok(())
}

/// Option haggling. Returns true when the client completed
/// negotiation and wants to enter transmission.
fn negotiate<E: Export>(
    stream: &mut TcpStream,
    export: &E,
    no_zeroes: bool,
) -> Result<bool, NbdError> {
    loop {
        let mut head = [0u8; 16];
        stream.read_exact(&mut head)?;
        let mut buf = &head[..];
        let magic = buf.get_u64();
        if magic != NBD_OPTS_MAGIC {
            return Err(NbdError::Protocol(format!(
                "bad option magic {:016x}",
                magic
            )));
        }
        let option = buf.get_u32();
        let length = buf.get_u32() as usize;
        let mut data = vec![0u8; length];
        stream.read_exact(&mut data)?;

        match option {
            NBD_OPT_GO => {
                let mut buf = &data[..];
                if buf.remaining() < 4 {
                    return Err(NbdError::Protocol("short go option".into()));
                }
                let name_len = buf.get_u32() as usize;
                if buf.remaining() < name_len {
                    return Err(NbdError::Protocol("short go option".into()));
                }
                let name = String::from_utf8_lossy(&buf[..name_len]).to_string();
                if !name.is_empty() && name != export.name() {
                    option_reply(stream, option, NBD_REP_ERR_UNKNOWN, b"unknown export")?;
                    continue;
                }

                let mut info = BytesMut::new();
                info.put_u16(NBD_INFO_EXPORT);
                info.put_u64(export.size());
                info.put_u16(transmission_flags());
                option_reply(stream, option, NBD_REP_INFO, &info)?;

                let (min, preferred, max) = export.block_sizes();
                let mut info = BytesMut::new();
                info.put_u16(NBD_INFO_BLOCK_SIZE);
                info.put_u32(min);
                info.put_u32(preferred);
                info.put_u32(max);
                option_reply(stream, option, NBD_REP_INFO, &info)?;

                option_reply(stream, option, NBD_REP_ACK, &[])?;
                return Ok(true);
            }
            // legacy clients finish negotiation with EXPORT_NAME
            NBD_OPT_EXPORT_NAME => {
                let mut reply = BytesMut::new();
                reply.put_u64(export.size());
                reply.put_u16(transmission_flags());
                if !no_zeroes {
                    reply.put_slice(&[0u8; 124]);
                }
                stream.write_all(&reply)?;
                return Ok(true);
            }
            NBD_OPT_ABORT => {
                option_reply(stream, option, NBD_REP_ACK, &[])?;
                return Ok(false);
            }
            other => {
                debug!("unsupported option {}", other);
                option_reply(stream, other, NBD_REP_ERR_UNSUP, &[])?;
            }
        }
    }
}

fn option_reply(
    stream: &mut TcpStream,
    option: u32,
    reply: u32,
    data: &[u8],
) -> Result<(), NbdError> {
    let mut buf = BytesMut::with_capacity(20 + data.len());
    buf.put_u64(NBD_REP_MAGIC);
    buf.put_u32(option);
    buf.put_u32(reply);
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    stream.write_all(&buf)?;
    Ok(())
}

fn simple_reply(
    stream: &mut TcpStream,
    cookie: u64,
    errno: u32,
    payload: &[u8],
) -> Result<(), NbdError> {
    let mut buf = BytesMut::with_capacity(16 + payload.len());
    buf.put_u32(NBD_SIMPLE_REPLY_MAGIC);
    buf.put_u32(errno);
    buf.put_u64(cookie);
    buf.put_slice(payload);
    stream.write_all(&buf)?;
    Ok(())
}

fn transmission<E: Export>(stream: &mut TcpStream, export: &E) -> Result<(), NbdError> {
    let (_, _, max_request) = export.block_sizes();
    loop {
        let mut raw = [0u8; Request::SIZE];
        match stream.read_exact(&mut raw) {
            Ok(()) => {}
            // client went away without DISC
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        let request = Request::parse(&raw)?;

        match request.command {
            NBD_CMD_DISC => return Ok(()),
            NBD_CMD_FLUSH => simple_reply(stream, request.cookie, 0, &[])?,
            NBD_CMD_READ => {
                if request.length == 0
                    || request.length > max_request
                    || request.offset + request.length as u64 > export.size()
                {
                    simple_reply(stream, request.cookie, NBD_EINVAL, &[])?;
                    continue;
                }
                let mut payload = vec![0u8; request.length as usize];
                match export.read_at(&mut payload, request.offset) {
                    Ok(()) => simple_reply(stream, request.cookie, 0, &payload)?,
                    Err(err) => {
                        error!(
                            "read {}+{} failed: {}",
                            request.offset, request.length, err
                        );
                        let errno = match err {
                            NbdError::Io(_) => NBD_EIO,
                            _ => NBD_EINVAL,
                        };
                        simple_reply(stream, request.cookie, errno, &[])?;
                    }
                }
            }
            NBD_CMD_WRITE => {
                // drain the payload before rejecting, the stream has
                // to stay in sync
                let mut payload = vec![0u8; request.length as usize];
                stream.read_exact(&mut payload)?;
                simple_reply(stream, request.cookie, NBD_EPERM, &[])?;
            }
            _ => simple_reply(stream, request.cookie, NBD_EINVAL, &[])?,
        }
    }
}
