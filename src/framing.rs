//! Length-prefixed framing over a byte stream. `PacketReader` and
//! `PacketWriter` turn a `Read`/`Write` endpoint (normally a `TcpStream`)
//! into a stream of `Packet` values.

use std::io::{self, Read, Write};

use crate::error::{CxlError, ParseError};
use crate::packet::{Packet, HEADER_LEN};

/// Default ceiling on a single frame's `length` field: generous room over
/// the largest payload the codec currently produces.
pub const DEFAULT_MAX_FRAME_LEN: usize = 4096 + 64;

pub struct PacketReader<R> {
    inner: R,
    max_frame_len: usize,
}

impl<R: Read> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_frame_len(inner, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(inner: R, max_frame_len: usize) -> Self {
        PacketReader {
            inner,
            max_frame_len,
        }
    }

    /// Reads one frame off the stream. Returns `Ok(None)` on a clean EOF
    /// that lands exactly on a frame boundary (the peer closed the
    /// connection between packets); any EOF in the middle of a frame is a
    /// hard `CxlError::Io`.
    pub fn get_packet(&mut self) -> Result<Option<Packet>, CxlError> {
        let mut len_buf = [0u8; 2];
        match read_exact_or_eof(&mut self.inner, &mut len_buf)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Full => {}
        }
        let length = u16::from_le_bytes(len_buf) as usize;
        if length < HEADER_LEN {
            return Err(CxlError::Parse(ParseError::InvalidLength(length)));
        }
        if length > self.max_frame_len {
            return Err(CxlError::Parse(ParseError::InvalidLength(length)));
        }
        let mut buf = vec![0u8; length];
        buf[0..2].copy_from_slice(&len_buf);
        self.inner.read_exact(&mut buf[2..])?;
        let packet = Packet::parse(&buf)?;
        Ok(Some(packet))
    }
}

enum ReadOutcome {
    Full,
    Eof,
}

/// Like `Read::read_exact`, but distinguishes "zero bytes read, stream
/// closed cleanly" from "stream closed partway through".
fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(ReadOutcome::Eof);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed mid-frame",
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(ReadOutcome::Full)
}

pub struct PacketWriter<W> {
    inner: W,
}

impl<W: Write> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        PacketWriter { inner }
    }

    pub fn write(&mut self, packet: &Packet) -> Result<(), CxlError> {
        let bytes = packet.serialize();
        self.inner.write_all(&bytes)?;
        self.inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{CxlMemRead, Packet};
    use std::io::Cursor;

    fn sample() -> Packet {
        Packet::CxlMemRead(CxlMemRead {
            ld_id: 1,
            tag: 2,
            address: 0xdead_beef,
        })
    }

    #[test]
    fn write_then_read_roundtrips() {
        let mut buf = Vec::new();
        {
            let mut w = PacketWriter::new(&mut buf);
            w.write(&sample()).unwrap();
        }
        let mut r = PacketReader::new(Cursor::new(buf));
        let got = r.get_packet().unwrap().unwrap();
        assert_eq!(got, sample());
        assert!(r.get_packet().unwrap().is_none());
    }

    #[test]
    fn two_packets_back_to_back() {
        let mut buf = Vec::new();
        {
            let mut w = PacketWriter::new(&mut buf);
            w.write(&sample()).unwrap();
            w.write(&sample()).unwrap();
        }
        let mut r = PacketReader::new(Cursor::new(buf));
        assert!(r.get_packet().unwrap().is_some());
        assert!(r.get_packet().unwrap().is_some());
        assert!(r.get_packet().unwrap().is_none());
    }

    #[test]
    fn eof_mid_frame_is_an_error() {
        let mut buf = Vec::new();
        {
            let mut w = PacketWriter::new(&mut buf);
            w.write(&sample()).unwrap();
        }
        buf.truncate(buf.len() - 2);
        let mut r = PacketReader::new(Cursor::new(buf));
        let err = r.get_packet().unwrap_err();
        assert!(matches!(err, CxlError::Io(_)));
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&60000u16.to_le_bytes());
        buf.extend_from_slice(&[0u8; 5]);
        let mut r = PacketReader::new(Cursor::new(buf));
        let err = r.get_packet().unwrap_err();
        assert!(matches!(err, CxlError::Parse(ParseError::InvalidLength(_))));
    }
}
