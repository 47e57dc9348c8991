//! Fragmented MP4 slicer
//!
//! Splits a continuous fMP4 byte stream at top-level box boundaries into
//! transport units:
//!
//! - `ftyp` + `moov` form the initialization unit
//! - `moof` + `mdat` form one media unit
//!
//! Any other top-level box (`styp`, `sidx`, `free`, ...) is carried along
//! with the unit it precedes.

use bytes::{Buf, Bytes, BytesMut};

use super::chunk::UnitKind;
use crate::error::MirrorError;

/// Four-character box types the slicer cares about
pub mod box_type {
    pub const FTYP: [u8; 4] = *b"ftyp";
    pub const MOOV: [u8; 4] = *b"moov";
    pub const MOOF: [u8; 4] = *b"moof";
    pub const MDAT: [u8; 4] = *b"mdat";
    pub const TRAF: [u8; 4] = *b"traf";
    pub const TFHD: [u8; 4] = *b"tfhd";
    pub const TRUN: [u8; 4] = *b"trun";
}

/// Upper bound for one top-level box
const MAX_BOX_SIZE: u64 = 64 * 1024 * 1024;

/// `sample_is_non_sync_sample` in ISO/IEC 14496-12 sample flags
const SAMPLE_IS_NON_SYNC: u32 = 0x0001_0000;

/// Parsed box header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub kind: [u8; 4],
    /// Header length (8, or 16 with a 64-bit size)
    pub header_len: usize,
    /// Whole box length including the header
    pub size: usize,
}

/// Parse the header at the start of `buf`
///
/// `Ok(None)` means more bytes are needed.
pub fn read_box_header(buf: &[u8]) -> Result<Option<BoxHeader>, MirrorError> {
    if buf.len() < 8 {
        return Ok(None);
    }
    let size32 = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let kind = [buf[4], buf[5], buf[6], buf[7]];

    let (size, header_len) = match size32 {
        0 => {
            return Err(MirrorError::ProtocolViolation(format!(
                "box {} extends to end of stream",
                fourcc(&kind)
            )))
        }
        1 => {
            if buf.len() < 16 {
                return Ok(None);
            }
            let mut large = [0u8; 8];
            large.copy_from_slice(&buf[8..16]);
            (u64::from_be_bytes(large), 16)
        }
        n => (n as u64, 8),
    };

    if size < header_len as u64 || size > MAX_BOX_SIZE {
        return Err(MirrorError::ProtocolViolation(format!(
            "box {} has invalid size {}",
            fourcc(&kind),
            size
        )));
    }

    Ok(Some(BoxHeader {
        kind,
        header_len,
        size: size as usize,
    }))
}

fn fourcc(kind: &[u8; 4]) -> String {
    String::from_utf8_lossy(kind).into_owned()
}

/// Unit cut from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicedUnit {
    pub kind: UnitKind,
    /// First sample of the fragment is a sync sample (media units only)
    pub key_unit: bool,
    pub data: Bytes,
}

/// Incremental top-level box slicer
#[derive(Debug, Default)]
pub struct Fmp4Slicer {
    input: BytesMut,
    /// Boxes of the unit being assembled
    group: BytesMut,
    key_unit: bool,
    init_seen: bool,
}

impl Fmp4Slicer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the initialization unit has been emitted
    pub fn init_seen(&self) -> bool {
        self.init_seen
    }

    /// Append stream bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.input.extend_from_slice(bytes);
    }

    /// Next complete unit, if the buffered bytes contain one
    pub fn next_unit(&mut self) -> Result<Option<SlicedUnit>, MirrorError> {
        while let Some(header) = read_box_header(&self.input)? {
            if self.input.len() < header.size {
                return Ok(None);
            }
            let boxed = self.input.split_to(header.size);

            match header.kind {
                box_type::MOOF => {
                    self.key_unit = moof_starts_with_sync(&boxed[header.header_len..]);
                    self.group.extend_from_slice(&boxed);
                }
                box_type::MOOV => {
                    self.group.extend_from_slice(&boxed);
                    self.init_seen = true;
                    return Ok(Some(SlicedUnit {
                        kind: UnitKind::Init,
                        key_unit: false,
                        data: self.group.split().freeze(),
                    }));
                }
                box_type::MDAT => {
                    self.group.extend_from_slice(&boxed);
                    let key_unit = std::mem::take(&mut self.key_unit);
                    return Ok(Some(SlicedUnit {
                        kind: UnitKind::Media,
                        key_unit,
                        data: self.group.split().freeze(),
                    }));
                }
                // ftyp and anything else ride along with the next unit
                _ => self.group.extend_from_slice(&boxed),
            }
        }
        Ok(None)
    }
}

/// Iterate the child boxes of a container payload
fn children(mut payload: &[u8]) -> impl Iterator<Item = ([u8; 4], &[u8])> {
    std::iter::from_fn(move || {
        let header = read_box_header(payload).ok().flatten()?;
        if payload.len() < header.size {
            return None;
        }
        let (this, rest) = payload.split_at(header.size);
        payload = rest;
        Some((header.kind, &this[header.header_len..]))
    })
}

/// Whether the first sample of the first track fragment is a sync sample
///
/// Sample flags come from `trun` (first-sample or per-sample flags) and fall
/// back to the `tfhd` default. Undeterminable flags count as non-key.
fn moof_starts_with_sync(moof: &[u8]) -> bool {
    let Some((_, traf)) = children(moof).find(|(kind, _)| *kind == box_type::TRAF) else {
        return false;
    };

    let mut default_flags = None;
    let mut first_flags = None;
    for (kind, body) in children(traf) {
        match kind {
            box_type::TFHD => default_flags = tfhd_default_sample_flags(body),
            box_type::TRUN => first_flags = trun_first_sample_flags(body),
            _ => {}
        }
    }

    first_flags
        .or(default_flags)
        .is_some_and(|flags| flags & SAMPLE_IS_NON_SYNC == 0)
}

fn tfhd_default_sample_flags(mut body: &[u8]) -> Option<u32> {
    if body.remaining() < 8 {
        return None;
    }
    let flags = body.get_u32() & 0x00ff_ffff;
    body.advance(4); // track_ID

    let mut skip = 0;
    if flags & 0x01 != 0 {
        skip += 8; // base_data_offset
    }
    for bit in [0x02, 0x08, 0x10] {
        if flags & bit != 0 {
            skip += 4;
        }
    }
    if flags & 0x20 == 0 || body.remaining() < skip + 4 {
        return None;
    }
    body.advance(skip);
    Some(body.get_u32())
}

fn trun_first_sample_flags(mut body: &[u8]) -> Option<u32> {
    if body.remaining() < 8 {
        return None;
    }
    let flags = body.get_u32() & 0x00ff_ffff;
    let sample_count = body.get_u32();

    if flags & 0x01 != 0 {
        if body.remaining() < 4 {
            return None;
        }
        body.advance(4); // data_offset
    }
    if flags & 0x04 != 0 {
        return (body.remaining() >= 4).then(|| body.get_u32());
    }
    if flags & 0x400 == 0 || sample_count == 0 {
        return None;
    }

    let mut skip = 0;
    if flags & 0x100 != 0 {
        skip += 4; // sample_duration
    }
    if flags & 0x200 != 0 {
        skip += 4; // sample_size
    }
    if body.remaining() < skip + 4 {
        return None;
    }
    body.advance(skip);
    Some(body.get_u32())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_box(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(kind);
        out.extend_from_slice(payload);
        out
    }

    fn full_box(kind: &[u8; 4], flags: u32, fields: &[u32]) -> Vec<u8> {
        let mut payload = (flags & 0x00ff_ffff).to_be_bytes().to_vec();
        for f in fields {
            payload.extend_from_slice(&f.to_be_bytes());
        }
        mk_box(kind, &payload)
    }

    /// moof with a trun carrying first_sample_flags
    fn moof(first_sample_flags: u32) -> Vec<u8> {
        let tfhd = full_box(b"tfhd", 0x020000, &[1]);
        let trun = full_box(b"trun", 0x000005, &[1, 0, first_sample_flags]);
        let traf = mk_box(b"traf", &[tfhd, trun].concat());
        mk_box(b"moof", &[mk_box(b"mfhd", &[0, 0, 0, 0, 0, 0, 0, 1]), traf].concat())
    }

    fn stream() -> Vec<u8> {
        [
            mk_box(b"ftyp", b"iso5\0\0\0\0"),
            mk_box(b"moov", &[0u8; 32]),
            moof(0x0200_0000),
            mk_box(b"mdat", &[7u8; 100]),
            moof(0x0101_0000),
            mk_box(b"mdat", &[9u8; 50]),
        ]
        .concat()
    }

    fn drain(slicer: &mut Fmp4Slicer) -> Vec<SlicedUnit> {
        let mut out = Vec::new();
        while let Some(unit) = slicer.next_unit().unwrap() {
            out.push(unit);
        }
        out
    }

    #[test]
    fn test_slices_init_and_media_units() {
        let data = stream();
        let mut slicer = Fmp4Slicer::new();
        slicer.push(&data);
        let units = drain(&mut slicer);

        assert_eq!(units.len(), 3);
        assert_eq!(units[0].kind, UnitKind::Init);
        assert_eq!(&units[0].data[4..8], b"ftyp");
        assert_eq!(units[1].kind, UnitKind::Media);
        assert!(units[1].key_unit);
        assert_eq!(&units[1].data[4..8], b"moof");
        assert_eq!(units[2].kind, UnitKind::Media);
        assert!(!units[2].key_unit);
        assert!(slicer.init_seen());

        let total: usize = units.iter().map(|u| u.data.len()).sum();
        assert_eq!(total, data.len());
    }

    #[test]
    fn test_byte_at_a_time_matches_bulk() {
        let data = stream();
        let mut bulk = Fmp4Slicer::new();
        bulk.push(&data);
        let expected = drain(&mut bulk);

        let mut slicer = Fmp4Slicer::new();
        let mut units = Vec::new();
        for byte in &data {
            slicer.push(std::slice::from_ref(byte));
            units.extend(drain(&mut slicer));
        }
        assert_eq!(units, expected);
    }

    #[test]
    fn test_styp_rides_with_next_fragment() {
        let data = [
            mk_box(b"styp", b"msdh"),
            moof(0x0200_0000),
            mk_box(b"mdat", &[1u8; 10]),
        ]
        .concat();
        let mut slicer = Fmp4Slicer::new();
        slicer.push(&data);
        let units = drain(&mut slicer);
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0].data[4..8], b"styp");
        assert_eq!(units[0].data.len(), data.len());
    }

    #[test]
    fn test_key_flag_falls_back_to_tfhd_default() {
        let tfhd = full_box(b"tfhd", 0x000020, &[1, 0x0200_0000]);
        let trun = full_box(b"trun", 0x000001, &[1, 0]);
        let traf = mk_box(b"traf", &[tfhd, trun].concat());
        assert!(moof_starts_with_sync(&traf));

        let tfhd = full_box(b"tfhd", 0x000020, &[1, 0x0101_0000]);
        let trun = full_box(b"trun", 0x000001, &[1, 0]);
        let traf = mk_box(b"traf", &[tfhd, trun].concat());
        assert!(!moof_starts_with_sync(&traf));
    }

    #[test]
    fn test_key_flag_from_per_sample_flags() {
        let tfhd = full_box(b"tfhd", 0, &[1]);
        // duration + size + flags per sample
        let trun = full_box(b"trun", 0x000700, &[2, 3000, 512, 0x0200_0000, 3000, 256, 0x0101_0000]);
        let traf = mk_box(b"traf", &[tfhd, trun].concat());
        assert!(moof_starts_with_sync(&traf));
    }

    #[test]
    fn test_invalid_box_size() {
        let mut slicer = Fmp4Slicer::new();
        slicer.push(&[0, 0, 0, 4, b'm', b'o', b'o', b'f']);
        assert!(matches!(
            slicer.next_unit(),
            Err(MirrorError::ProtocolViolation(_))
        ));

        assert!(read_box_header(&[0, 0, 0, 0, b'm', b'd', b'a', b't']).is_err());
        assert_eq!(read_box_header(&[0, 0, 0]).unwrap(), None);
    }

    #[test]
    fn test_large_size_header() {
        let mut data = vec![0, 0, 0, 1];
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&20u64.to_be_bytes());
        data.extend_from_slice(&[0u8; 4]);
        let header = read_box_header(&data).unwrap().unwrap();
        assert_eq!(header.header_len, 16);
        assert_eq!(header.size, 20);
    }
}
