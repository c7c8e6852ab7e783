//! Persisted binary envelope format (spec §6 "Persisted envelope format").
//!
//! Metadata items, whole metadata records, and summaries share one outer
//! envelope: a 2-byte ASCII signature (`MD` or `SU`), a 2-byte version, a
//! 4-byte big-endian length, and the payload. Inner payload encoding is
//! type-tag + varint-length + bytes.
//!
//! Grounded in the teacher's `backup/data_blob.rs` header-then-payload
//! layout, reimplemented over `std::io::{Read,Write}` rather than
//! `proxmox::tools::io`'s `ReadExt`/`WriteExt` (not a reusable dependency
//! here).

use std::io::{self, Read, Write};

use crate::error::{ArkError, Result};
use crate::value::{SourceDescriptor, Style, TypeCode, Value};

pub const METADATA_SIGNATURE: &[u8; 2] = b"MD";
pub const SUMMARY_SIGNATURE: &[u8; 2] = b"SU";
pub const ENVELOPE_VERSION: u16 = 1;

/// Writes one envelope (signature + version + length-prefixed payload).
pub fn write_envelope<W: Write>(w: &mut W, signature: &[u8; 2], payload: &[u8]) -> Result<()> {
    w.write_all(signature)?;
    w.write_all(&ENVELOPE_VERSION.to_be_bytes())?;
    w.write_all(&(payload.len() as u32).to_be_bytes())?;
    w.write_all(payload)?;
    Ok(())
}

/// Reads one envelope, skipping any leading zero padding bytes first (spec
/// §6: "Leading zero padding bytes are skipped by the reader").
pub fn read_envelope<R: Read>(r: &mut R, expect: &[u8; 2]) -> Result<Option<Vec<u8>>> {
    let mut sig = [0u8; 2];
    loop {
        match r.read_exact(&mut sig[..1]) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if sig[0] != 0 {
            break;
        }
    }
    r.read_exact(&mut sig[1..2])?;
    if &sig != expect {
        return Err(ArkError::consistency(format!(
            "bad envelope signature {:?}, expected {:?}",
            sig, expect
        )));
    }
    let mut version = [0u8; 2];
    r.read_exact(&mut version)?;
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(Some(payload))
}

pub(crate) fn write_varint(buf: &mut Vec<u8>, mut n: u64) {
    loop {
        let mut byte = (n & 0x7f) as u8;
        n >>= 7;
        if n != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if n == 0 {
            break;
        }
    }
}

pub(crate) fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| ArkError::consistency("truncated varint"))?;
        *pos += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(result)
}

pub(crate) fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

pub(crate) fn read_bytes<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    let len = read_varint(buf, pos)? as usize;
    let start = *pos;
    let end = start
        .checked_add(len)
        .ok_or_else(|| ArkError::consistency("varint length overflow"))?;
    let slice = buf
        .get(start..end)
        .ok_or_else(|| ArkError::consistency("truncated byte field"))?;
    *pos = end;
    Ok(slice)
}

pub(crate) fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_bytes(buf, s.as_bytes());
}

pub(crate) fn read_str<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a str> {
    std::str::from_utf8(read_bytes(buf, pos)?)
        .map_err(|_| ArkError::consistency("non-utf8 string field"))
}

/// Encodes one [`Value`] to its canonical inner payload: a type-tag byte,
/// then per-type-code fields.
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(value.type_code() as u8);
    match value {
        Value::Origin {
            style,
            centre,
            subcentre,
            process,
        } => {
            buf.push(*style as u8);
            buf.extend_from_slice(&centre.to_be_bytes());
            buf.extend_from_slice(&subcentre.to_be_bytes());
            buf.extend_from_slice(&process.to_be_bytes());
        }
        Value::Product {
            style,
            centre,
            discipline,
            category,
            number,
        } => {
            buf.push(*style as u8);
            buf.extend_from_slice(&centre.to_be_bytes());
            buf.push(*discipline);
            buf.push(*category);
            buf.extend_from_slice(&number.to_be_bytes());
        }
        Value::Level { style, ltype, l1, l2 } => {
            buf.push(*style as u8);
            buf.extend_from_slice(&ltype.to_be_bytes());
            buf.extend_from_slice(&l1.to_be_bytes());
            match l2 {
                Some(v) => {
                    buf.push(1);
                    buf.extend_from_slice(&v.to_be_bytes());
                }
                None => buf.push(0),
            }
        }
        Value::Timerange { style, unit, p1, p2 } => {
            buf.push(*style as u8);
            buf.push(*unit);
            buf.extend_from_slice(&p1.to_be_bytes());
            buf.extend_from_slice(&p2.to_be_bytes());
        }
        Value::Reftime(rt) => {
            write_varint(&mut buf, rt.min().timestamp() as u64);
            write_varint(&mut buf, rt.max().timestamp() as u64);
        }
        Value::Area { grid_type, values } => {
            write_str(&mut buf, grid_type);
            write_varint(&mut buf, values.len() as u64);
            for (k, v) in values {
                write_str(&mut buf, k);
                write_varint(&mut buf, *v as u64);
            }
        }
        Value::Proddef { values } => {
            write_varint(&mut buf, values.len() as u64);
            for (k, v) in values {
                write_str(&mut buf, k);
                write_varint(&mut buf, *v as u64);
            }
        }
        Value::Run { style, hour, minute } => {
            buf.push(*style as u8);
            buf.push(*hour);
            buf.push(*minute);
        }
        Value::Note { text } => write_str(&mut buf, text),
        Value::Source { format, descriptor } => {
            write_str(&mut buf, format);
            match descriptor {
                SourceDescriptor::Blob {
                    base_dir,
                    relpath,
                    offset,
                    size,
                } => {
                    buf.push(0);
                    write_str(&mut buf, base_dir);
                    write_str(&mut buf, relpath);
                    write_varint(&mut buf, *offset);
                    write_varint(&mut buf, *size);
                }
                SourceDescriptor::Inline { size } => {
                    buf.push(1);
                    write_varint(&mut buf, *size);
                }
                SourceDescriptor::Url { url } => {
                    buf.push(2);
                    write_str(&mut buf, url);
                }
            }
        }
        Value::AssignedDataset { dataset, id } => {
            write_str(&mut buf, dataset);
            write_varint(&mut buf, *id as u64);
        }
        Value::Task { text } => write_str(&mut buf, text),
        Value::Quantity { values } => {
            write_varint(&mut buf, values.len() as u64);
            for v in values {
                write_str(&mut buf, v);
            }
        }
        Value::Scalar { bytes, .. } => write_bytes(&mut buf, bytes),
    }
    buf
}

/// Decodes a single [`Value`] from its canonical inner payload.
pub fn decode_value(buf: &[u8]) -> Result<Value> {
    let mut pos = 0usize;
    let tag = *buf
        .get(pos)
        .ok_or_else(|| ArkError::consistency("empty value payload"))?;
    pos += 1;
    let code = TypeCode::ALL
        .iter()
        .copied()
        .find(|t| *t as u8 == tag)
        .ok_or_else(|| ArkError::consistency(format!("unknown type-code tag {}", tag)))?;

    let read_u16 = |buf: &[u8], pos: &mut usize| -> Result<u16> {
        let bytes: [u8; 2] = buf
            .get(*pos..*pos + 2)
            .ok_or_else(|| ArkError::consistency("truncated u16"))?
            .try_into()
            .unwrap();
        *pos += 2;
        Ok(u16::from_be_bytes(bytes))
    };
    let read_u32 = |buf: &[u8], pos: &mut usize| -> Result<u32> {
        let bytes: [u8; 4] = buf
            .get(*pos..*pos + 4)
            .ok_or_else(|| ArkError::consistency("truncated u32"))?
            .try_into()
            .unwrap();
        *pos += 4;
        Ok(u32::from_be_bytes(bytes))
    };
    let read_i32 = |buf: &[u8], pos: &mut usize| -> Result<i32> {
        Ok(read_u32(buf, pos)? as i32)
    };
    let read_style = |buf: &[u8], pos: &mut usize| -> Result<Style> {
        let b = *buf
            .get(*pos)
            .ok_or_else(|| ArkError::consistency("truncated style"))?;
        *pos += 1;
        Ok(match b {
            1 => Style::Grib1,
            2 => Style::Grib2,
            3 => Style::Bufr,
            4 => Style::Odimh5,
            _ => Style::Generic,
        })
    };

    Ok(match code {
        TypeCode::Origin => Value::Origin {
            style: read_style(buf, &mut pos)?,
            centre: read_u16(buf, &mut pos)?,
            subcentre: read_u16(buf, &mut pos)?,
            process: read_u16(buf, &mut pos)?,
        },
        TypeCode::Product => Value::Product {
            style: read_style(buf, &mut pos)?,
            centre: read_u16(buf, &mut pos)?,
            discipline: {
                let b = *buf.get(pos).ok_or_else(|| ArkError::consistency("eof"))?;
                pos += 1;
                b
            },
            category: {
                let b = *buf.get(pos).ok_or_else(|| ArkError::consistency("eof"))?;
                pos += 1;
                b
            },
            number: read_u16(buf, &mut pos)?,
        },
        TypeCode::Level => {
            let style = read_style(buf, &mut pos)?;
            let ltype = read_u16(buf, &mut pos)?;
            let l1 = read_i32(buf, &mut pos)?;
            let has_l2 = *buf.get(pos).ok_or_else(|| ArkError::consistency("eof"))?;
            pos += 1;
            let l2 = if has_l2 == 1 {
                Some(read_i32(buf, &mut pos)?)
            } else {
                None
            };
            Value::Level { style, ltype, l1, l2 }
        }
        TypeCode::Timerange => {
            let style = read_style(buf, &mut pos)?;
            let unit = *buf.get(pos).ok_or_else(|| ArkError::consistency("eof"))?;
            pos += 1;
            let p1 = read_u32(buf, &mut pos)?;
            let p2 = read_u32(buf, &mut pos)?;
            Value::Timerange { style, unit, p1, p2 }
        }
        TypeCode::Reftime => {
            let min = read_varint(buf, &mut pos)? as i64;
            let max = read_varint(buf, &mut pos)? as i64;
            use chrono::{TimeZone, Utc};
            let min_dt = Utc.timestamp_opt(min, 0).single().unwrap();
            let max_dt = Utc.timestamp_opt(max, 0).single().unwrap();
            Value::Reftime(if min == max {
                crate::reftime::Reftime::Point(min_dt)
            } else {
                crate::reftime::Reftime::Interval(min_dt, max_dt)
            })
        }
        TypeCode::Area => {
            let grid_type = read_str(buf, &mut pos)?.to_string();
            let n = read_varint(buf, &mut pos)?;
            let mut values = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let k = read_str(buf, &mut pos)?.to_string();
                let v = read_varint(buf, &mut pos)? as i64;
                values.push((k, v));
            }
            Value::Area { grid_type, values }
        }
        TypeCode::Proddef => {
            let n = read_varint(buf, &mut pos)?;
            let mut values = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let k = read_str(buf, &mut pos)?.to_string();
                let v = read_varint(buf, &mut pos)? as i64;
                values.push((k, v));
            }
            Value::Proddef { values }
        }
        TypeCode::Run => {
            let style = read_style(buf, &mut pos)?;
            let hour = *buf.get(pos).ok_or_else(|| ArkError::consistency("eof"))?;
            pos += 1;
            let minute = *buf.get(pos).ok_or_else(|| ArkError::consistency("eof"))?;
            Value::Run { style, hour, minute }
        }
        TypeCode::Note => Value::Note {
            text: read_str(buf, &mut pos)?.to_string(),
        },
        TypeCode::Source => {
            let format = read_str(buf, &mut pos)?.to_string();
            let kind = *buf.get(pos).ok_or_else(|| ArkError::consistency("eof"))?;
            pos += 1;
            let descriptor = match kind {
                0 => SourceDescriptor::Blob {
                    base_dir: read_str(buf, &mut pos)?.to_string(),
                    relpath: read_str(buf, &mut pos)?.to_string(),
                    offset: read_varint(buf, &mut pos)?,
                    size: read_varint(buf, &mut pos)?,
                },
                1 => SourceDescriptor::Inline {
                    size: read_varint(buf, &mut pos)?,
                },
                2 => SourceDescriptor::Url {
                    url: read_str(buf, &mut pos)?.to_string(),
                },
                other => {
                    return Err(ArkError::consistency(format!(
                        "unknown source descriptor kind {}",
                        other
                    )))
                }
            };
            Value::Source { format, descriptor }
        }
        TypeCode::AssignedDataset => Value::AssignedDataset {
            dataset: read_str(buf, &mut pos)?.to_string(),
            id: read_varint(buf, &mut pos)? as i64,
        },
        TypeCode::Task => Value::Task {
            text: read_str(buf, &mut pos)?.to_string(),
        },
        TypeCode::Quantity => {
            let n = read_varint(buf, &mut pos)?;
            let mut values = Vec::with_capacity(n as usize);
            for _ in 0..n {
                values.push(read_str(buf, &mut pos)?.to_string());
            }
            Value::Quantity { values }
        }
        TypeCode::Value => Value::Scalar {
            code: TypeCode::Value,
            bytes: read_bytes(buf, &mut pos)?.to_vec(),
        },
    })
}

/// Encodes a list of values as a varint count followed by each value's
/// canonical bytes, length-prefixed. Shared by the index backends, whose
/// rows each carry a fingerprint (and, for sqlite, an attribute set) as a
/// list of values rather than a single one.
pub(crate) fn encode_value_list(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::new();
    write_varint(&mut buf, values.len() as u64);
    for v in values {
        write_bytes(&mut buf, &encode_value(v));
    }
    buf
}

pub(crate) fn decode_value_list(buf: &[u8]) -> Result<Vec<Value>> {
    let mut pos = 0usize;
    let count = read_varint(buf, &mut pos)?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        values.push(decode_value(read_bytes(buf, &mut pos)?)?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reftime::Reftime;
    use chrono::{TimeZone, Utc};

    #[test]
    fn value_roundtrips_through_canonical_bytes() {
        let v = Value::Origin {
            style: Style::Grib1,
            centre: 200,
            subcentre: 0,
            process: 1,
        };
        let bytes = encode_value(&v);
        assert_eq!(decode_value(&bytes).unwrap(), v);
    }

    #[test]
    fn reftime_point_roundtrips() {
        let t = Utc.with_ymd_and_hms(2007, 7, 8, 0, 0, 0).unwrap();
        let v = Value::Reftime(Reftime::Point(t));
        let bytes = encode_value(&v);
        assert_eq!(decode_value(&bytes).unwrap(), v);
    }

    #[test]
    fn envelope_roundtrips_and_skips_padding() {
        let mut buf = vec![0u8, 0u8, 0u8];
        write_envelope(&mut buf, METADATA_SIGNATURE, b"hello").unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let payload = read_envelope(&mut cursor, METADATA_SIGNATURE)
            .unwrap()
            .unwrap();
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn envelope_rejects_wrong_signature() {
        let mut buf = Vec::new();
        write_envelope(&mut buf, SUMMARY_SIGNATURE, b"x").unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_envelope(&mut cursor, METADATA_SIGNATURE).is_err());
    }
}
