//! TRDP wire format: frame headers, check sequences and validation.
//!
//! Both traffic classes share the same leading header fields through
//! `dataset_length`; the PD header continues with the pull-reply addressing,
//! the MD header with session identification and URIs. All integer fields
//! are big-endian on the wire except the frame check sequences, which the
//! protocol stores little-endian regardless of host byte order.

use crc::{CRC_32_ISO_HDLC, Crc};
use zerocopy::byteorder::{BigEndian, I32, LittleEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Error, Result};

/// Size of the frame check sequence trailing header and payload.
pub const FCS_SIZE: usize = 4;

/// Size of the process data header.
pub const PD_HEADER_SIZE: usize = std::mem::size_of::<PdHeader>();

/// Size of the message data header.
pub const MD_HEADER_SIZE: usize = std::mem::size_of::<MdHeader>();

/// Maximum PD payload in octets.
pub const PD_MAX_DATA: usize = 1432;

/// Maximum PD frame on the wire (header + payload + payload FCS).
pub const PD_MAX_PACKET: usize = PD_HEADER_SIZE + PD_MAX_DATA + FCS_SIZE;

/// Maximum MD frame on the wire.
pub const MD_MAX_PACKET: usize = 65388;

/// Maximum MD payload in octets.
pub const MD_MAX_DATA: usize = MD_MAX_PACKET - MD_HEADER_SIZE - FCS_SIZE;

/// Protocol version carried in every header; only the high byte (major
/// version) is validated on reception.
pub const PROTOCOL_VERSION: u16 = 0x0100;

/// Length of the URI user parts in the MD header, zero padded.
pub const URI_USER_SIZE: usize = 32;

/// Length of an MD session identifier.
pub const SESSION_ID_SIZE: usize = 16;

const FCS: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 frame check sequence (seed `0xFFFF_FFFF`, IEEE polynomial).
#[inline]
pub fn fcs32(data: &[u8]) -> u32 {
    FCS.checksum(data)
}

/// Gross PD frame size for a given payload size.
///
/// Empty frames carry no payload FCS.
#[inline]
pub const fn pd_packet_size(data_size: usize) -> usize {
    if data_size > 0 {
        PD_HEADER_SIZE + data_size + FCS_SIZE
    } else {
        PD_HEADER_SIZE
    }
}

/// Gross MD frame size for a given payload size.
#[inline]
pub const fn md_packet_size(data_size: usize) -> usize {
    if data_size > 0 {
        MD_HEADER_SIZE + data_size + FCS_SIZE
    } else {
        MD_HEADER_SIZE
    }
}

/// Message type identifiers: two ASCII characters read as a big-endian u16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    /// 'Pd' — PD data (push or pull reply).
    Pd = 0x5064,
    /// 'Pr' — PD pull request.
    Pr = 0x5072,
    /// 'Pe' — PD error.
    Pe = 0x5065,
    /// 'Mn' — MD notification (request without reply).
    Mn = 0x4D6E,
    /// 'Mr' — MD request with reply.
    Mr = 0x4D72,
    /// 'Mp' — MD reply without confirmation.
    Mp = 0x4D70,
    /// 'Mq' — MD reply with confirmation request.
    Mq = 0x4D71,
    /// 'Mc' — MD confirm.
    Mc = 0x4D63,
    /// 'Me' — MD error reply.
    Me = 0x4D65,
}

impl MsgType {
    /// Parse a wire value; `None` for unknown types (a protocol error).
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x5064 => Some(Self::Pd),
            0x5072 => Some(Self::Pr),
            0x5065 => Some(Self::Pe),
            0x4D6E => Some(Self::Mn),
            0x4D72 => Some(Self::Mr),
            0x4D70 => Some(Self::Mp),
            0x4D71 => Some(Self::Mq),
            0x4D63 => Some(Self::Mc),
            0x4D65 => Some(Self::Me),
            _ => None,
        }
    }

    /// Message types carried in PD frames.
    pub fn is_pd(self) -> bool {
        matches!(self, Self::Pd | Self::Pr | Self::Pe)
    }

    /// Message types carried in MD frames.
    pub fn is_md(self) -> bool {
        !self.is_pd()
    }
}

/// Process data header — network order, packed, CRC protected.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PdHeader {
    /// Monotonic counter per (comId, source, message type).
    pub sequence_counter: U32<BigEndian>,
    /// Protocol version, major in the high byte.
    pub protocol_version: U16<BigEndian>,
    /// Message type ('Pd', 'Pr', 'Pe').
    pub msg_type: U16<BigEndian>,
    /// Telegram identifier, the primary routing key.
    pub com_id: U32<BigEndian>,
    /// ETB topography counter, zero disables matching.
    pub etb_topo_cnt: U32<BigEndian>,
    /// Operational train topography counter, zero disables matching.
    pub op_trn_topo_cnt: U32<BigEndian>,
    /// Net payload length, 0..=1432.
    pub dataset_length: U32<BigEndian>,
    /// Reserved, must be sent as zero.
    pub reserved: U32<BigEndian>,
    /// ComId a pull reply shall be published under (pull request only).
    pub reply_com_id: U32<BigEndian>,
    /// Address a pull reply shall be sent to (pull request only).
    pub reply_ip_address: U32<BigEndian>,
    /// CRC-32 over the preceding header bytes, little-endian.
    pub frame_check_sum: U32<LittleEndian>,
}

/// Message data header — network order, packed, CRC protected.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MdHeader {
    /// Counter, incremented per (re)transmission of a session.
    pub sequence_counter: U32<BigEndian>,
    /// Protocol version, major in the high byte.
    pub protocol_version: U16<BigEndian>,
    /// Message type ('Mn', 'Mr', 'Mp', 'Mq', 'Mc', 'Me').
    pub msg_type: U16<BigEndian>,
    /// Telegram identifier, the primary routing key.
    pub com_id: U32<BigEndian>,
    /// ETB topography counter, zero disables matching.
    pub etb_topo_cnt: U32<BigEndian>,
    /// Operational train topography counter, zero disables matching.
    pub op_trn_topo_cnt: U32<BigEndian>,
    /// Net payload length.
    pub dataset_length: U32<BigEndian>,
    /// Reply status, zero when OK, negative protocol status otherwise.
    pub reply_status: I32<BigEndian>,
    /// Session identifier correlating one exchange across retries.
    pub session_id: [u8; SESSION_ID_SIZE],
    /// Reply timeout in microseconds (request only).
    pub reply_timeout: U32<BigEndian>,
    /// Source URI user part, zero padded.
    pub source_uri: [u8; URI_USER_SIZE],
    /// Destination URI user part, zero padded.
    pub destination_uri: [u8; URI_USER_SIZE],
    /// CRC-32 over the preceding header bytes, little-endian.
    pub frame_check_sum: U32<LittleEndian>,
}

impl PdHeader {
    /// Parse a header from the start of a frame.
    pub fn from_frame(frame: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(frame)
            .map(|(h, _)| h)
            .map_err(|_| Error::Wire("PD frame shorter than header"))
    }

    /// Mutable header view into a frame buffer.
    pub fn mut_from_frame(frame: &mut [u8]) -> Result<&mut Self> {
        Self::mut_from_prefix(frame)
            .map(|(h, _)| h)
            .map_err(|_| Error::Wire("PD frame shorter than header"))
    }

    /// Header bytes as sent on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }
}

impl MdHeader {
    /// Parse a header from the start of a frame.
    pub fn from_frame(frame: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(frame)
            .map(|(h, _)| h)
            .map_err(|_| Error::Wire("MD frame shorter than header"))
    }

    /// Mutable header view into a frame buffer.
    pub fn mut_from_frame(frame: &mut [u8]) -> Result<&mut Self> {
        Self::mut_from_prefix(frame)
            .map(|(h, _)| h)
            .map_err(|_| Error::Wire("MD frame shorter than header"))
    }

    /// Header bytes as sent on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }
}

/// Recompute and store both check sequences of a PD frame.
///
/// The header FCS covers every header byte before the FCS field; a payload
/// FCS trails the payload iff `dataset_length > 0`. The caller guarantees
/// the buffer is sized `pd_packet_size(dataset_length)`.
pub fn seal_pd(frame: &mut [u8]) {
    seal(frame, PD_HEADER_SIZE);
}

/// Recompute and store both check sequences of an MD frame.
pub fn seal_md(frame: &mut [u8]) {
    seal(frame, MD_HEADER_SIZE);
}

fn seal(frame: &mut [u8], header_size: usize) {
    let hdr_fcs = fcs32(&frame[..header_size - FCS_SIZE]);
    frame[header_size - FCS_SIZE..header_size].copy_from_slice(&hdr_fcs.to_le_bytes());

    let data_len = frame.len().saturating_sub(header_size + FCS_SIZE);
    if data_len > 0 {
        let data_fcs = fcs32(&frame[header_size..header_size + data_len]);
        frame[header_size + data_len..].copy_from_slice(&data_fcs.to_le_bytes());
    }
}

/// Validate a received PD frame and return its header view.
///
/// Checks, in order: frame size, header FCS, payload FCS (iff a payload is
/// present), protocol major version, message type, length consistency.
/// Topography and sequence counter checks are the caller's business since
/// they need session state.
pub fn check_pd(frame: &[u8]) -> Result<&PdHeader> {
    if frame.len() < PD_HEADER_SIZE || frame.len() > PD_MAX_PACKET {
        return Err(Error::Wire("PD frame size out of bounds"));
    }

    let header = PdHeader::from_frame(frame)?;

    let computed = fcs32(&frame[..PD_HEADER_SIZE - FCS_SIZE]);
    if computed != header.frame_check_sum.get() {
        return Err(Error::Crc {
            expected: header.frame_check_sum.get(),
            actual: computed,
        });
    }

    let data_len = header.dataset_length.get() as usize;
    if data_len > PD_MAX_DATA || frame.len() < pd_packet_size(data_len) {
        return Err(Error::Wire("PD dataset length inconsistent"));
    }

    if data_len > 0 {
        let stored = u32::from_le_bytes(
            frame[PD_HEADER_SIZE + data_len..PD_HEADER_SIZE + data_len + FCS_SIZE]
                .try_into()
                .unwrap(),
        );
        let computed = fcs32(&frame[PD_HEADER_SIZE..PD_HEADER_SIZE + data_len]);
        if computed != stored {
            return Err(Error::Crc {
                expected: stored,
                actual: computed,
            });
        }
    }

    if header.protocol_version.get() & 0xFF00 != PROTOCOL_VERSION & 0xFF00 {
        return Err(Error::Wire("PD protocol version mismatch"));
    }

    match MsgType::from_u16(header.msg_type.get()) {
        Some(t) if t.is_pd() => {}
        _ => return Err(Error::Wire("not a PD message type")),
    }

    Ok(header)
}

/// Validate a received MD frame and return its header view.
///
/// Same checks as [`check_pd`] with the MD header layout and message types.
pub fn check_md(frame: &[u8]) -> Result<&MdHeader> {
    if frame.len() < MD_HEADER_SIZE || frame.len() > MD_MAX_PACKET {
        return Err(Error::Wire("MD frame size out of bounds"));
    }

    let header = MdHeader::from_frame(frame)?;

    let computed = fcs32(&frame[..MD_HEADER_SIZE - FCS_SIZE]);
    if computed != header.frame_check_sum.get() {
        return Err(Error::Crc {
            expected: header.frame_check_sum.get(),
            actual: computed,
        });
    }

    let data_len = header.dataset_length.get() as usize;
    if data_len > MD_MAX_DATA || frame.len() < md_packet_size(data_len) {
        return Err(Error::Wire("MD dataset length inconsistent"));
    }

    if data_len > 0 {
        let stored = u32::from_le_bytes(
            frame[MD_HEADER_SIZE + data_len..MD_HEADER_SIZE + data_len + FCS_SIZE]
                .try_into()
                .unwrap(),
        );
        let computed = fcs32(&frame[MD_HEADER_SIZE..MD_HEADER_SIZE + data_len]);
        if computed != stored {
            return Err(Error::Crc {
                expected: stored,
                actual: computed,
            });
        }
    }

    if header.protocol_version.get() & 0xFF00 != PROTOCOL_VERSION & 0xFF00 {
        return Err(Error::Wire("MD protocol version mismatch"));
    }

    match MsgType::from_u16(header.msg_type.get()) {
        Some(t) if t.is_md() => {}
        _ => return Err(Error::Wire("not an MD message type")),
    }

    Ok(header)
}

/// Zero-pad or truncate a URI user part into its fixed wire field.
pub fn uri_field(uri: &str) -> [u8; URI_USER_SIZE] {
    let mut field = [0u8; URI_USER_SIZE];
    let bytes = uri.as_bytes();
    let n = bytes.len().min(URI_USER_SIZE);
    field[..n].copy_from_slice(&bytes[..n]);
    field
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pd_frame(data: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; pd_packet_size(data.len())];
        {
            let header = PdHeader::mut_from_frame(&mut frame).unwrap();
            header.sequence_counter.set(42);
            header.protocol_version.set(PROTOCOL_VERSION);
            header.msg_type.set(MsgType::Pd as u16);
            header.com_id.set(12345);
            header.etb_topo_cnt.set(7);
            header.dataset_length.set(data.len() as u32);
        }
        frame[PD_HEADER_SIZE..PD_HEADER_SIZE + data.len()].copy_from_slice(data);
        seal_pd(&mut frame);
        frame
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(PD_HEADER_SIZE, 40);
        assert_eq!(MD_HEADER_SIZE, 116);
    }

    #[test]
    fn test_msg_type_ascii() {
        // 'P' = 0x50, 'd' = 0x64
        assert_eq!(MsgType::Pd as u16, u16::from_be_bytes(*b"Pd"));
        assert_eq!(MsgType::Mr as u16, u16::from_be_bytes(*b"Mr"));
        assert_eq!(MsgType::from_u16(0x0000), None);
        assert!(MsgType::Pr.is_pd());
        assert!(MsgType::Mc.is_md());
    }

    #[test]
    fn test_pd_seal_and_check() {
        let frame = sample_pd_frame(b"hello-world-0000");
        let header = check_pd(&frame).unwrap();
        assert_eq!(header.com_id.get(), 12345);
        assert_eq!(header.sequence_counter.get(), 42);
        assert_eq!(header.dataset_length.get(), 16);
    }

    #[test]
    fn test_pd_empty_payload_has_no_data_fcs() {
        let frame = sample_pd_frame(&[]);
        assert_eq!(frame.len(), PD_HEADER_SIZE);
        check_pd(&frame).unwrap();
    }

    #[test]
    fn test_pd_header_corruption_detected() {
        let mut frame = sample_pd_frame(b"abcd");
        frame[8] ^= 0xFF; // com_id byte
        assert!(matches!(check_pd(&frame), Err(Error::Crc { .. })));
    }

    #[test]
    fn test_pd_payload_corruption_detected() {
        let mut frame = sample_pd_frame(b"abcd");
        frame[PD_HEADER_SIZE] ^= 0x01;
        assert!(matches!(check_pd(&frame), Err(Error::Crc { .. })));
    }

    #[test]
    fn test_pd_version_mismatch_rejected() {
        let mut frame = sample_pd_frame(b"abcd");
        {
            let header = PdHeader::mut_from_frame(&mut frame).unwrap();
            header.protocol_version.set(0x0200);
        }
        seal_pd(&mut frame);
        assert!(matches!(check_pd(&frame), Err(Error::Wire(_))));
    }

    #[test]
    fn test_pd_rejects_md_types() {
        let mut frame = sample_pd_frame(b"abcd");
        {
            let header = PdHeader::mut_from_frame(&mut frame).unwrap();
            header.msg_type.set(MsgType::Mn as u16);
        }
        seal_pd(&mut frame);
        assert!(matches!(check_pd(&frame), Err(Error::Wire(_))));
    }

    #[test]
    fn test_fcs_is_little_endian_on_wire() {
        let frame = sample_pd_frame(b"abcd");
        let computed = fcs32(&frame[..PD_HEADER_SIZE - FCS_SIZE]);
        assert_eq!(
            frame[PD_HEADER_SIZE - FCS_SIZE..PD_HEADER_SIZE],
            computed.to_le_bytes()
        );
    }

    #[test]
    fn test_md_seal_and_check() {
        let data = b"request-payload.";
        let mut frame = vec![0u8; md_packet_size(data.len())];
        {
            let header = MdHeader::mut_from_frame(&mut frame).unwrap();
            header.protocol_version.set(PROTOCOL_VERSION);
            header.msg_type.set(MsgType::Mr as u16);
            header.com_id.set(100);
            header.dataset_length.set(data.len() as u32);
            header.session_id = [7u8; SESSION_ID_SIZE];
            header.reply_timeout.set(2_000_000);
            header.source_uri = uri_field("devA");
            header.destination_uri = uri_field("devB");
        }
        frame[MD_HEADER_SIZE..MD_HEADER_SIZE + data.len()].copy_from_slice(data);
        seal_md(&mut frame);

        let header = check_md(&frame).unwrap();
        assert_eq!(header.session_id, [7u8; SESSION_ID_SIZE]);
        assert_eq!(&header.source_uri[..4], b"devA");
    }

    #[test]
    fn test_uri_field_truncates() {
        let field = uri_field("a-very-long-uri-user-part-overflowing-the-field");
        assert_eq!(field.len(), URI_USER_SIZE);
        assert_eq!(&field[..7], b"a-very-");
    }
}
