//! In-place timestamp editing for fragmented MP4 payloads
//!
//! Only the boxes trick play restamping touches are understood:
//! `moov/mvhd`, `moov/trak/mdia/mdhd`, `moof/traf/{tfhd,tfdt,trun}`.

use crate::{Error, Result};
use bytes::BytesMut;
use std::ops::Range;

/// Rewrites timing fields of boxed fragments
pub trait TimestampWriter: Send + Sync {
    /// Set the base decode time and sample duration of a media fragment
    fn set_pts_and_duration(&self, payload: &mut BytesMut, pts: u64, duration: u64) -> Result<()>;

    /// Set the movie and media timescale of an init fragment
    fn set_timescale(&self, payload: &mut BytesMut, timescale: u32) -> Result<()>;

    /// Zero the media header duration of an init fragment
    fn clear_media_header_duration(&self, payload: &mut BytesMut) -> Result<()>;
}

/// ISO base media file format implementation of [`TimestampWriter`]
#[derive(Debug, Clone, Copy, Default)]
pub struct IsoBmffTimestampWriter;

const TFHD_BASE_DATA_OFFSET: u32 = 0x01;
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x02;
const TFHD_DEFAULT_SAMPLE_DURATION: u32 = 0x08;
const TRUN_DATA_OFFSET: u32 = 0x01;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x04;
const TRUN_SAMPLE_DURATION: u32 = 0x100;

#[derive(Debug, Clone, Copy)]
struct BoxHeader {
    kind: [u8; 4],
    /// Offset of the first payload byte
    payload: usize,
    /// Offset one past the last byte
    end: usize,
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32> {
    buf.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| Error::MalformedContainer(format!("truncated field at offset {}", at)))
}

fn read_u64(buf: &[u8], at: usize) -> Result<u64> {
    let hi = read_u32(buf, at)? as u64;
    let lo = read_u32(buf, at + 4)? as u64;
    Ok((hi << 32) | lo)
}

fn write_u32(buf: &mut [u8], at: usize, value: u32) -> Result<()> {
    let slot = buf
        .get_mut(at..at + 4)
        .ok_or_else(|| Error::MalformedContainer(format!("truncated field at offset {}", at)))?;
    slot.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

fn write_u64(buf: &mut [u8], at: usize, value: u64) -> Result<()> {
    let slot = buf
        .get_mut(at..at + 8)
        .ok_or_else(|| Error::MalformedContainer(format!("truncated field at offset {}", at)))?;
    slot.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

fn read_header(buf: &[u8], at: usize, limit: usize) -> Result<BoxHeader> {
    let size = read_u32(buf, at)? as u64;
    let kind_bytes = buf
        .get(at + 4..at + 8)
        .ok_or_else(|| Error::MalformedContainer(format!("truncated box header at {}", at)))?;
    let kind = [kind_bytes[0], kind_bytes[1], kind_bytes[2], kind_bytes[3]];

    let (payload, size) = match size {
        0 => (at + 8, (limit - at) as u64),
        1 => (at + 16, read_u64(buf, at + 8)?),
        size => (at + 8, size),
    };
    let end = at as u64 + size;
    if end > limit as u64 || (payload as u64) > end {
        return Err(Error::MalformedContainer(format!(
            "box {} at {} overruns its parent",
            String::from_utf8_lossy(&kind),
            at
        )));
    }
    Ok(BoxHeader {
        kind,
        payload,
        end: end as usize,
    })
}

/// Child boxes of `kind` within `range`
fn children(buf: &[u8], range: Range<usize>, kind: &[u8; 4]) -> Result<Vec<BoxHeader>> {
    let mut found = Vec::new();
    let mut at = range.start;
    while at + 8 <= range.end {
        let header = read_header(buf, at, range.end)?;
        if &header.kind == kind {
            found.push(header);
        }
        at = header.end;
    }
    Ok(found)
}

fn first_child(buf: &[u8], range: Range<usize>, kind: &[u8; 4]) -> Result<BoxHeader> {
    children(buf, range, kind)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::MalformedContainer(format!("missing {} box", String::from_utf8_lossy(kind))))
}

fn full_box_flags(buf: &[u8], header: &BoxHeader) -> Result<(u8, u32)> {
    let word = read_u32(buf, header.payload)?;
    Ok(((word >> 24) as u8, word & 0x00ff_ffff))
}

/// Offset of the timescale field in mvhd/mdhd
fn timescale_offset(buf: &[u8], header: &BoxHeader) -> Result<(usize, u8)> {
    let (version, _) = full_box_flags(buf, header)?;
    let offset = match version {
        0 => header.payload + 12,
        1 => header.payload + 20,
        v => return Err(Error::MalformedContainer(format!("unsupported header version {}", v))),
    };
    Ok((offset, version))
}

impl IsoBmffTimestampWriter {
    fn media_headers(buf: &[u8]) -> Result<Vec<BoxHeader>> {
        let moov = first_child(buf, 0..buf.len(), b"moov")?;
        let mut headers = Vec::new();
        for trak in children(buf, moov.payload..moov.end, b"trak")? {
            let mdia = first_child(buf, trak.payload..trak.end, b"mdia")?;
            headers.push(first_child(buf, mdia.payload..mdia.end, b"mdhd")?);
        }
        if headers.is_empty() {
            return Err(Error::MalformedContainer("moov has no trak".into()));
        }
        Ok(headers)
    }
}

impl TimestampWriter for IsoBmffTimestampWriter {
    fn set_pts_and_duration(&self, payload: &mut BytesMut, pts: u64, duration: u64) -> Result<()> {
        let buf = &mut payload[..];
        let moofs = children(buf, 0..buf.len(), b"moof")?;
        if moofs.is_empty() {
            return Err(Error::MalformedContainer("missing moof box".into()));
        }

        let duration32 = u32::try_from(duration)
            .map_err(|_| Error::MalformedContainer(format!("sample duration {} exceeds 32 bits", duration)))?;

        for moof in moofs {
            for traf in children(buf, moof.payload..moof.end, b"traf")? {
                let tfdt = first_child(buf, traf.payload..traf.end, b"tfdt")?;
                match full_box_flags(buf, &tfdt)?.0 {
                    1 => write_u64(buf, tfdt.payload + 4, pts)?,
                    _ => {
                        let pts32 = u32::try_from(pts).map_err(|_| {
                            Error::MalformedContainer(format!("decode time {} exceeds version 0 tfdt", pts))
                        })?;
                        write_u32(buf, tfdt.payload + 4, pts32)?;
                    }
                }

                if let Some(tfhd) = children(buf, traf.payload..traf.end, b"tfhd")?.into_iter().next() {
                    let (_, flags) = full_box_flags(buf, &tfhd)?;
                    if flags & TFHD_DEFAULT_SAMPLE_DURATION != 0 {
                        let mut at = tfhd.payload + 8;
                        if flags & TFHD_BASE_DATA_OFFSET != 0 {
                            at += 8;
                        }
                        if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
                            at += 4;
                        }
                        write_u32(buf, at, duration32)?;
                    }
                }

                for trun in children(buf, traf.payload..traf.end, b"trun")? {
                    let (_, flags) = full_box_flags(buf, &trun)?;
                    let sample_count = read_u32(buf, trun.payload + 4)?;
                    if flags & TRUN_SAMPLE_DURATION == 0 || sample_count == 0 {
                        continue;
                    }
                    let mut at = trun.payload + 8;
                    if flags & TRUN_DATA_OFFSET != 0 {
                        at += 4;
                    }
                    if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
                        at += 4;
                    }
                    write_u32(buf, at, duration32)?;
                }
            }
        }
        Ok(())
    }

    fn set_timescale(&self, payload: &mut BytesMut, timescale: u32) -> Result<()> {
        let buf = &mut payload[..];
        let moov = first_child(buf, 0..buf.len(), b"moov")?;
        let mvhd = first_child(buf, moov.payload..moov.end, b"mvhd")?;
        let (at, _) = timescale_offset(buf, &mvhd)?;
        write_u32(buf, at, timescale)?;

        for mdhd in Self::media_headers(buf)? {
            let (at, _) = timescale_offset(buf, &mdhd)?;
            write_u32(buf, at, timescale)?;
        }
        Ok(())
    }

    fn clear_media_header_duration(&self, payload: &mut BytesMut) -> Result<()> {
        let buf = &mut payload[..];
        for mdhd in Self::media_headers(buf)? {
            let (at, version) = timescale_offset(buf, &mdhd)?;
            if version == 1 {
                write_u64(buf, at + 4, 0)?;
            } else {
                write_u32(buf, at + 4, 0)?;
            }
        }
        Ok(())
    }
}
