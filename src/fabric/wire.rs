//! On-the-wire formats: the data-plane packet header and the TCP handshake
//! records.
//!
//! Both formats are raw fixed-size byte layouts, not `serde`-encoded: the
//! data-plane header must line up with the layout the NIC writes into a
//! registered buffer, and the handshake record must read back with exactly
//! `size_of::<ConnectInfo>()` bytes per [`super::error::HandshakeError::ShortRead`].

use std::mem::size_of;

use crate::rdma::gid::Gid;

use super::error::HandshakeError;

/// Size of the data-plane packet header, in bytes.
pub const HEADER_SIZE: usize = 20;

/// Data-plane packet header, identical on both directions of the wire.
///
/// ```text
/// offset  size  field
/// 0       8     callback_tag
/// 8       8     context
/// 16      4     length
/// 20      N     payload
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Opaque 64-bit token. On the client side this is the registry key for
    /// the completion callback; the server only ever echoes it back.
    pub callback_tag: u64,

    /// Opaque 64-bit application correlator, round-tripped verbatim.
    pub context: u64,

    /// Payload length in bytes, as actually written after truncation.
    pub length: u32,
}

impl PacketHeader {
    /// Encode the header into the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`HEADER_SIZE`].
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.callback_tag.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.context.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.length.to_ne_bytes());
    }

    /// Decode a header from the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`HEADER_SIZE`].
    pub fn decode(buf: &[u8]) -> Self {
        let callback_tag = u64::from_ne_bytes(buf[0..8].try_into().unwrap());
        let context = u64::from_ne_bytes(buf[8..16].try_into().unwrap());
        let length = u32::from_ne_bytes(buf[16..20].try_into().unwrap());
        Self {
            callback_tag,
            context,
            length,
        }
    }
}

/// Frame `payload` into `buf` as a [`PacketHeader`] followed by as much of
/// the payload as fits, truncating silently if `payload` is larger than
/// `buf` can hold after the header. Returns the number of payload bytes
/// actually written (also the header's `length` field).
///
/// # Panics
///
/// Panics if `buf` is shorter than [`HEADER_SIZE`].
pub fn frame(buf: &mut [u8], callback_tag: u64, context: u64, payload: &[u8]) -> usize {
    let len = payload.len().min(buf.len() - HEADER_SIZE);
    let hdr = PacketHeader {
        callback_tag,
        context,
        length: len as u32,
    };
    hdr.encode(buf);
    buf[HEADER_SIZE..HEADER_SIZE + len].copy_from_slice(&payload[..len]);
    len
}

/// Tag values for [`ConnectInfo::ty`].
///
/// The exact ordinals only need to agree between the two sides of a
/// connection; they are not a public wire contract shared with other
/// implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RecordType {
    /// GID and QP-count exchange, once per peer.
    HostInfo = 1,
    /// Per-QP routing info exchange, `number_of_qp` times per peer.
    ChannelInfo = 2,
    /// Final barrier record that gates data-plane traffic.
    GoGo = 3,
}

impl RecordType {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::HostInfo),
            2 => Some(Self::ChannelInfo),
            3 => Some(Self::GoGo),
            _ => None,
        }
    }
}

/// Body of a [`ConnectInfo`] record. Only the variant matching the record's
/// `type` tag is meaningful; the others are zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBody {
    /// `HostInfo` body: the peer's GID and how many QPs it will open.
    Host { gid: Gid, number_of_qp: u32 },
    /// `ChannelInfo` body: one QP's routing info.
    Channel { qp_num: u32, dlid: u16, sl: u8 },
    /// `GoGo` body: empty.
    Gogo,
}

/// One fixed-size handshake record, exchanged verbatim over the TCP
/// side-channel.
///
/// The layout is deliberately simple (tag, then the union's widest member,
/// zero-padded) rather than self-describing or length-prefixed: both sides
/// always know which variant to expect next from the handshake's own
/// sequencing, so the record itself carries no length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectInfo {
    pub body: ConnectBody,
}

// On-wire layout: 4B type tag + 28B union payload (big enough for the `Host`
// variant: 16B gid + 4B number_of_qp, padded).
const UNION_SIZE: usize = 20;
const RECORD_SIZE: usize = 4 + UNION_SIZE;

impl ConnectInfo {
    /// Size of the encoded record, in bytes. All handshake reads must
    /// consume exactly this many bytes.
    pub const SIZE: usize = RECORD_SIZE;

    pub fn host(gid: Gid, number_of_qp: u32) -> Self {
        Self {
            body: ConnectBody::Host { gid, number_of_qp },
        }
    }

    pub fn channel(qp_num: u32, dlid: u16, sl: u8) -> Self {
        Self {
            body: ConnectBody::Channel { qp_num, dlid, sl },
        }
    }

    pub fn gogo() -> Self {
        Self {
            body: ConnectBody::Gogo,
        }
    }

    /// Encode this record as exactly [`Self::SIZE`] bytes.
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        let ty: u32 = match &self.body {
            ConnectBody::Host { .. } => RecordType::HostInfo as u32,
            ConnectBody::Channel { .. } => RecordType::ChannelInfo as u32,
            ConnectBody::Gogo => RecordType::GoGo as u32,
        };
        buf[0..4].copy_from_slice(&ty.to_ne_bytes());

        let union = &mut buf[4..4 + UNION_SIZE];
        match &self.body {
            ConnectBody::Host { gid, number_of_qp } => {
                let raw: [u8; 16] = (*gid).into();
                union[0..16].copy_from_slice(&raw);
                union[16..20].copy_from_slice(&number_of_qp.to_ne_bytes());
            }
            ConnectBody::Channel { qp_num, dlid, sl } => {
                union[0..4].copy_from_slice(&qp_num.to_ne_bytes());
                union[4..6].copy_from_slice(&dlid.to_ne_bytes());
                union[6] = *sl;
            }
            ConnectBody::Gogo => {}
        }
        buf
    }

    /// Decode a record of the expected `ty` from exactly [`Self::SIZE`]
    /// bytes. Returns [`HandshakeError::ShortRead`] if `buf` is the wrong
    /// length and [`HandshakeError::UnexpectedType`] if the tag doesn't
    /// match `expected`.
    pub fn decode(buf: &[u8], expected: RecordType) -> Result<Self, HandshakeError> {
        if buf.len() != RECORD_SIZE {
            return Err(HandshakeError::ShortRead {
                expected: RECORD_SIZE,
                got: buf.len(),
            });
        }

        let ty_raw = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        let ty = RecordType::from_u32(ty_raw).ok_or(HandshakeError::UnexpectedType {
            expected,
            got: ty_raw,
        })?;
        if ty as u32 != expected as u32 {
            return Err(HandshakeError::UnexpectedType {
                expected,
                got: ty_raw,
            });
        }

        let union = &buf[4..4 + UNION_SIZE];
        let body = match ty {
            RecordType::HostInfo => {
                let gid_bytes: [u8; 16] = union[0..16].try_into().unwrap();
                let number_of_qp = u32::from_ne_bytes(union[16..20].try_into().unwrap());
                ConnectBody::Host {
                    gid: Gid::from(gid_bytes),
                    number_of_qp,
                }
            }
            RecordType::ChannelInfo => {
                let qp_num = u32::from_ne_bytes(union[0..4].try_into().unwrap());
                let dlid = u16::from_ne_bytes(union[4..6].try_into().unwrap());
                let sl = union[6];
                ConnectBody::Channel { qp_num, dlid, sl }
            }
            RecordType::GoGo => ConnectBody::Gogo,
        };
        Ok(Self { body })
    }
}

const _: () = assert!(size_of::<u32>() == 4);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let hdr = PacketHeader {
            callback_tag: 0xdead_beef_0000_1234,
            context: 42,
            length: 11,
        };
        let mut buf = [0u8; HEADER_SIZE];
        hdr.encode(&mut buf);
        assert_eq!(PacketHeader::decode(&buf), hdr);
    }

    #[test]
    fn host_info_round_trips() {
        let gid = Gid::from([7u8; 16]);
        let rec = ConnectInfo::host(gid, 4);
        let buf = rec.encode();
        assert_eq!(buf.len(), ConnectInfo::SIZE);
        let decoded = ConnectInfo::decode(&buf, RecordType::HostInfo).unwrap();
        assert_eq!(decoded.body, rec.body);
    }

    #[test]
    fn channel_info_round_trips() {
        let rec = ConnectInfo::channel(0x1122_3344, 7, 0);
        let buf = rec.encode();
        let decoded = ConnectInfo::decode(&buf, RecordType::ChannelInfo).unwrap();
        assert_eq!(decoded.body, rec.body);
    }

    #[test]
    fn gogo_round_trips() {
        let rec = ConnectInfo::gogo();
        let buf = rec.encode();
        let decoded = ConnectInfo::decode(&buf, RecordType::GoGo).unwrap();
        assert_eq!(decoded.body, ConnectBody::Gogo);
    }

    #[test]
    fn wrong_type_is_rejected() {
        let rec = ConnectInfo::gogo();
        let buf = rec.encode();
        assert!(matches!(
            ConnectInfo::decode(&buf, RecordType::HostInfo),
            Err(HandshakeError::UnexpectedType { .. })
        ));
    }

    #[test]
    fn short_read_is_rejected() {
        let buf = [0u8; 4];
        assert!(matches!(
            ConnectInfo::decode(&buf, RecordType::GoGo),
            Err(HandshakeError::ShortRead { expected, got: 4 }) if expected == ConnectInfo::SIZE
        ));
    }

    #[test]
    fn frame_fits_payload_unchanged() {
        let mut buf = [0u8; HEADER_SIZE + 8];
        let written = frame(&mut buf, 1, 2, b"payload!");
        assert_eq!(written, 8);
        assert_eq!(&buf[HEADER_SIZE..], b"payload!");
        assert_eq!(PacketHeader::decode(&buf).length, 8);
    }

    #[test]
    fn frame_truncates_oversized_payload() {
        let mut buf = [0u8; HEADER_SIZE + 4];
        let oversized = b"way too long for this buffer";
        let written = frame(&mut buf, 9, 10, oversized);
        assert_eq!(written, 4);
        assert_eq!(&buf[HEADER_SIZE..], &oversized[..4]);
        let hdr = PacketHeader::decode(&buf);
        assert_eq!(hdr.length, 4);
        assert_eq!(hdr.callback_tag, 9);
        assert_eq!(hdr.context, 10);
    }

    #[test]
    fn frame_handles_exactly_zero_room() {
        let mut buf = [0u8; HEADER_SIZE];
        let written = frame(&mut buf, 0, 0, b"anything");
        assert_eq!(written, 0);
        assert_eq!(PacketHeader::decode(&buf).length, 0);
    }
}
