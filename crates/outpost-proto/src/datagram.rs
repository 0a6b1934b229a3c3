//! Framing for UDP flows multiplexed over one byte stream
//!
//! Record format:
//! - 1 byte: address family (4 or 6)
//! - 4 or 16 bytes: IP address
//! - 2 bytes: port (big-endian)
//! - 2 bytes: payload length (big-endian)
//! - payload
//!
//! A stream that ends between records is a clean end of stream; a stream that
//! ends inside a record is reported as [`DatagramError::Truncated`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Largest payload a single record can carry
pub const MAX_DATAGRAM_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum DatagramError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown address family: {0}")]
    UnknownFamily(u8),

    #[error("datagram too large: {0} bytes")]
    TooLarge(usize),

    #[error("stream ended inside a datagram record ({0} bytes left)")]
    Truncated(usize),
}

/// One UDP datagram together with the flow address it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub addr: SocketAddr,
    pub payload: Bytes,
}

impl Datagram {
    pub fn new(addr: SocketAddr, payload: impl Into<Bytes>) -> Self {
        Self {
            addr,
            payload: payload.into(),
        }
    }
}

/// Codec for [`Datagram`] records
#[derive(Debug, Clone, Copy, Default)]
pub struct DatagramCodec;

impl DatagramCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<Datagram> for DatagramCodec {
    type Error = DatagramError;

    fn encode(&mut self, item: Datagram, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_DATAGRAM_SIZE {
            return Err(DatagramError::TooLarge(item.payload.len()));
        }

        match item.addr.ip() {
            IpAddr::V4(ip) => {
                dst.reserve(1 + 4 + 4 + item.payload.len());
                dst.put_u8(FAMILY_V4);
                dst.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                dst.reserve(1 + 16 + 4 + item.payload.len());
                dst.put_u8(FAMILY_V6);
                dst.put_slice(&ip.octets());
            }
        }
        dst.put_u16(item.addr.port());
        dst.put_u16(item.payload.len() as u16);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Decoder for DatagramCodec {
    type Item = Datagram;
    type Error = DatagramError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&family) = src.first() else {
            return Ok(None);
        };

        let ip_len = match family {
            FAMILY_V4 => 4,
            FAMILY_V6 => 16,
            other => return Err(DatagramError::UnknownFamily(other)),
        };

        let header_len = 1 + ip_len + 4;
        if src.len() < header_len {
            src.reserve(header_len - src.len());
            return Ok(None);
        }

        let payload_len = u16::from_be_bytes([src[header_len - 2], src[header_len - 1]]) as usize;
        if src.len() < header_len + payload_len {
            src.reserve(header_len + payload_len - src.len());
            return Ok(None);
        }

        src.advance(1);
        let ip = if family == FAMILY_V4 {
            let mut octets = [0u8; 4];
            src.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        } else {
            let mut octets = [0u8; 16];
            src.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        };
        let port = src.get_u16();
        src.advance(2);
        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Datagram {
            addr: SocketAddr::new(ip, port),
            payload,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(datagram) => Ok(Some(datagram)),
            None if src.is_empty() => Ok(None),
            None => Err(DatagramError::Truncated(src.len())),
        }
    }
}
