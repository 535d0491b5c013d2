//! ASN.1 BER Encoding/Decoding utilities

use bytes::{BufMut, BytesMut};

/// Encode a tagged value (TLV)
pub fn encode_tagged(buf: &mut BytesMut, tag: u8, value: &[u8]) {
    buf.put_u8(tag);
    encode_length(buf, value.len());
    buf.put_slice(value);
}

/// Encode length in BER format
pub fn encode_length(buf: &mut BytesMut, len: usize) {
    if len < 128 {
        buf.put_u8(len as u8);
    } else if len < 256 {
        buf.put_u8(0x81);
        buf.put_u8(len as u8);
    } else if len < 65536 {
        buf.put_u8(0x82);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(0x84);
        buf.put_u32(len as u32);
    }
}

/// Encode a non-negative integer with minimal octets
pub fn encode_unsigned(buf: &mut BytesMut, tag: u8, value: u32) {
    let bytes = value.to_be_bytes();
    let mut start = bytes.iter().position(|b| *b != 0).unwrap_or(3);
    // Keep a leading zero so the value does not read as negative
    if bytes[start] & 0x80 != 0 && start > 0 {
        start -= 1;
    }
    encode_tagged(buf, tag, &bytes[start..]);
}

/// Decode a big-endian unsigned integer of up to four octets
pub fn decode_unsigned(data: &[u8]) -> Option<u32> {
    if data.is_empty() || data.len() > 5 || (data.len() == 5 && data[0] != 0) {
        return None;
    }
    Some(data.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}

/// Decode a TLV structure, returning the tag, its value and the total encoded length
pub fn decode_tagged(data: &[u8]) -> Option<(u8, &[u8], usize)> {
    if data.is_empty() {
        return None;
    }

    let tag = data[0];
    let (length, header_len) = decode_length(&data[1..])?;
    let total = 1 + header_len + length;

    if data.len() < total {
        return None;
    }

    Some((tag, &data[1 + header_len..total], total))
}

/// Decode BER length
pub fn decode_length(data: &[u8]) -> Option<(usize, usize)> {
    if data.is_empty() {
        return None;
    }

    let first = data[0];

    if first < 128 {
        Some((first as usize, 1))
    } else {
        let num_bytes = (first & 0x7F) as usize;
        // Indefinite form and absurd lengths are not used by TCAP
        if num_bytes == 0 || num_bytes > 4 || data.len() < 1 + num_bytes {
            return None;
        }

        let mut length = 0usize;
        for i in 0..num_bytes {
            length = (length << 8) | (data[1 + i] as usize);
        }

        Some((length, 1 + num_bytes))
    }
}

/// Sequential reader over concatenated TLVs
pub struct TlvReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> TlvReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    /// Tag of the next element without consuming it
    pub fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.offset).copied()
    }

    /// Next element, or `None` at end of input or on a truncated element
    pub fn read(&mut self) -> Option<(u8, &'a [u8])> {
        let (tag, value, total) = decode_tagged(&self.data[self.offset.min(self.data.len())..])?;
        self.offset += total;
        Some((tag, value))
    }
}

/// Encode OID
pub fn encode_oid(oid: &[u32]) -> Vec<u8> {
    if oid.len() < 2 {
        return vec![0];
    }

    let mut content = Vec::new();

    // First two arcs share one sub-identifier; under arc 2 it can exceed 127
    encode_oid_component(&mut content, oid[0].min(2) * 40 + oid[1].min(u32::MAX - 80));

    // Remaining components
    for &component in &oid[2..] {
        encode_oid_component(&mut content, component);
    }

    content
}

fn encode_oid_component(buf: &mut Vec<u8>, value: u32) {
    if value < 128 {
        buf.push(value as u8);
    } else {
        let mut bytes = Vec::new();
        let mut v = value;

        bytes.push((v & 0x7F) as u8);
        v >>= 7;

        while v > 0 {
            bytes.push(((v & 0x7F) | 0x80) as u8);
            v >>= 7;
        }

        bytes.reverse();
        buf.extend(bytes);
    }
}

/// Decode OID
pub fn decode_oid(data: &[u8]) -> Option<Vec<u32>> {
    if data.is_empty() {
        return None;
    }

    let (first, mut i) = decode_oid_component(data)?;
    let mut oid = match first {
        0..=39 => vec![0, first],
        40..=79 => vec![1, first - 40],
        _ => vec![2, first - 80],
    };

    while i < data.len() {
        let (component, len) = decode_oid_component(&data[i..])?;
        oid.push(component);
        i += len;
    }

    Some(oid)
}

fn decode_oid_component(data: &[u8]) -> Option<(u32, usize)> {
    let mut value = 0u32;
    let mut len = 0;

    for &byte in data {
        len += 1;
        if value > u32::MAX >> 7 {
            return None;
        }
        value = (value << 7) | ((byte & 0x7F) as u32);

        if byte & 0x80 == 0 {
            return Some((value, len));
        }
    }

    None
}
