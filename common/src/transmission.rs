//! Send and receive operations for [`Handle`].
//!
//! Every call branches on the TLS state first and the transport kind second,
//! so callers never have to care which of the two they are talking through.

use std::{
    io::{self, Read},
    mem::MaybeUninit,
    net::SocketAddr,
};

use socket2::SockAddr;

use crate::{
    error::{Error, Result},
    handle::{Handle, TransportKind},
    tls::TlsSession,
};

impl Handle {
    /// Writes `data` once and returns how many bytes the transport took.
    ///
    /// TLS handles and plain streams ignore `to`. Plain datagram and raw
    /// handles send to `to`, or to the connected peer when `to` is `None`.
    /// Streams may accept fewer bytes than requested, and TLS handles take at
    /// most one record per call; use [`Handle::send_all`] for full delivery.
    pub fn send(&mut self, data: &[u8], to: Option<(&str, u16)>) -> Result<usize> {
        let result = self.send_to_peer(data, to);
        self.record(result)
    }

    fn send_to_peer(&mut self, data: &[u8], to: Option<(&str, u16)>) -> Result<usize> {
        let dest = match (self.kind, &self.session, to) {
            (TransportKind::Stream, _, _) | (_, Some(_), _) | (_, _, None) => None,
            (_, None, Some((host, port))) => Some(self.sock_addr(host, port)?),
        };
        self.write_once(data, dest.as_ref())
    }

    fn write_once(&mut self, data: &[u8], dest: Option<&SockAddr>) -> Result<usize> {
        let (kind, connected) = (self.kind, self.connected);
        let socket = self.socket.as_mut().ok_or(Error::Closed)?;
        if let Some(session) = self.session.as_mut() {
            return session.write(socket, data);
        }

        match (kind, dest) {
            (TransportKind::Stream, _) => Ok(socket.send(data)?),
            (_, Some(addr)) => Ok(socket.send_to(data, addr)?),
            (_, None) if connected => Ok(socket.send(data)?),
            (_, None) => Err(Error::Misuse(
                "datagram send needs a destination or a connected peer",
            )),
        }
    }

    /// Keeps writing until every byte of `data` is accepted.
    ///
    /// Stops at the first failing or zero-length write, including a would-block
    /// or timeout, and reports how far delivery got through
    /// [`Error::Incomplete`]. On TLS handles `sent` only counts plaintext whose
    /// records fully reached the transport; the rest of the failing write is
    /// reported as `queued`. Interrupted writes are retried.
    pub fn send_all(&mut self, data: &[u8]) -> Result<()> {
        let mut sent = 0;
        while sent < data.len() {
            match self.write_once(&data[sent..], None) {
                Ok(0) => {
                    let source = Error::Io(io::ErrorKind::WriteZero.into());
                    return self.incomplete(sent, data.len(), source);
                }
                Ok(n) => sent += n,
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.incomplete(sent, data.len(), e),
            }
        }
        Ok(())
    }

    fn incomplete(&mut self, sent: usize, total: usize, source: Error) -> Result<()> {
        let queued = self.session.as_ref().map_or(0, TlsSession::queued);
        tracing::debug!(
            "send_all stopped after {} of {} bytes ({} queued): {}",
            sent,
            total,
            queued,
            source
        );
        self.record(Err(Error::Incomplete {
            sent,
            queued,
            total,
            source: Box::new(source),
        }))
    }

    /// Reads once into `buf`.
    ///
    /// Plain datagram and raw handles also report the sender. `Ok((0, _))`
    /// means the stream peer closed, or a zero-length datagram arrived.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<(usize, Option<SocketAddr>)> {
        let result = self.read_once(buf);
        self.record(result)
    }

    fn read_once(&mut self, buf: &mut [u8]) -> Result<(usize, Option<SocketAddr>)> {
        let kind = self.kind;
        let socket = self.socket.as_mut().ok_or(Error::Closed)?;
        if let Some(session) = self.session.as_mut() {
            return Ok((session.read(socket, buf)?, None));
        }

        match kind {
            TransportKind::Stream => Ok((socket.read(buf)?, None)),
            TransportKind::Datagram | TransportKind::Raw => {
                let (n, from) = socket.recv_from(as_uninit(buf))?;
                Ok((n, from.as_socket()))
            }
        }
    }

    /// Reads into `buf` until `delimiter` arrives, `buf` is one byte short of
    /// full, or the peer closes.
    ///
    /// The delimiter is kept and a NUL is written after the data, so at most
    /// `buf.len() - 1` bytes are returned. Returns the data length; a read
    /// error stops early and is recorded on the handle.
    pub fn receive_until(&mut self, buf: &mut [u8], delimiter: u8) -> usize {
        let (len, failure) = fill_until(buf, delimiter, |byte| {
            self.read_once(byte).map(|(n, _)| n)
        });
        if let Some(e) = failure {
            self.last_error = Some(e.code());
        }
        len
    }

    /// [`Handle::receive_until`] with a newline delimiter
    pub fn receive_line(&mut self, buf: &mut [u8]) -> usize {
        self.receive_until(buf, b'\n')
    }
}

/// Pulls single bytes from `read_byte` into `buf` with the
/// [`Handle::receive_until`] stopping rules. Interrupted reads are retried.
fn fill_until<F>(buf: &mut [u8], delimiter: u8, mut read_byte: F) -> (usize, Option<Error>)
where
    F: FnMut(&mut [u8]) -> Result<usize>,
{
    let Some(limit) = buf.len().checked_sub(1) else {
        return (0, None);
    };

    let mut len = 0;
    let mut byte = [0u8; 1];
    let mut failure = None;
    while len < limit {
        match read_byte(&mut byte) {
            Ok(1) => {}
            Ok(_) => break,
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
        buf[len] = byte[0];
        len += 1;
        if byte[0] == delimiter {
            break;
        }
    }
    buf[len] = 0;
    (len, failure)
}

fn as_uninit(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    // SAFETY: MaybeUninit<u8> has the same layout as u8, and the socket only
    // ever writes initialized bytes into the slice.
    unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) }
}
