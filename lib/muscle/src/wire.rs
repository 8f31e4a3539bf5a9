use crate::message::{fourcc, Field, Message, MessageRef, Point, Rect};
use crate::message::{
    TYPE_BOOL, TYPE_DOUBLE, TYPE_FLOAT, TYPE_INT16, TYPE_INT32, TYPE_INT64, TYPE_INT8,
    TYPE_MESSAGE, TYPE_POINT, TYPE_RECT, TYPE_STRING, TYPE_UINT16, TYPE_UINT32, TYPE_UINT64,
    TYPE_UINT8,
};
use crate::support::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Magic leading every flattened message; identifies the encoding version.
pub const PROTOCOL_VERSION_TAG: u32 = fourcc(*b"PM00");

/// Magic in the second slot of the gateway frame header; identifies message
/// framing as opposed to raw pass-through data.
pub const FRAME_MAGIC: u32 = fourcc(*b"Enc0");

/// Gateway frame header: `u32 body_size` + `u32 magic`.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum nesting depth accepted when decoding. Deeper input is rejected as
/// malformed rather than risking the stack.
const MAX_NESTING_DEPTH: usize = 64;

#[inline]
fn push_u32(out: &mut Vec<u8>, value: u32) {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, value);
    out.extend_from_slice(&buf);
}

/// Total size of the flattened encoding of `msg` in bytes.
pub fn flattened_size(msg: &Message) -> u32 {
    let mut size = 12u32;

    for (name, field) in msg.iter() {
        size += 4 + (name.len() as u32 + 1) + 4 + 4 + field_payload_size(field);
    }

    size
}

fn field_payload_size(field: &Field) -> u32 {
    match field {
        Field::Bool(items) => items.len() as u32,
        Field::Int8(items) => items.len() as u32,
        Field::UInt8(items) => items.len() as u32,
        Field::Int16(items) => items.len() as u32 * 2,
        Field::UInt16(items) => items.len() as u32 * 2,
        Field::Int32(items) => items.len() as u32 * 4,
        Field::UInt32(items) => items.len() as u32 * 4,
        Field::Float(items) => items.len() as u32 * 4,
        Field::Int64(items) => items.len() as u32 * 8,
        Field::UInt64(items) => items.len() as u32 * 8,
        Field::Double(items) => items.len() as u32 * 8,
        Field::Point(items) => items.len() as u32 * 8,
        Field::Rect(items) => items.len() as u32 * 16,
        Field::Str(items) => {
            4 + items.iter().map(|s| s.len() as u32 + 1).sum::<u32>()
        }
        Field::Message(items) => {
            4 + items.iter().map(|m| 4 + flattened_size(m)).sum::<u32>()
        }
        Field::Data(_, items) => 4 + items.iter().map(|b| 4 + b.len() as u32).sum::<u32>(),
    }
}

/// Flattens `msg` into a fresh buffer.
pub fn flatten(msg: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(flattened_size(msg) as usize);
    flatten_into(msg, &mut out);
    out
}

/// Appends the flattened encoding of `msg` to `out`.
pub fn flatten_into(msg: &Message, out: &mut Vec<u8>) {
    push_u32(out, PROTOCOL_VERSION_TAG);
    push_u32(out, msg.what());
    push_u32(out, msg.field_count() as u32);

    for (name, field) in msg.iter() {
        push_u32(out, name.len() as u32 + 1);
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        push_u32(out, field.type_code());
        push_u32(out, field_payload_size(field));
        flatten_payload(field, out);
    }
}

fn flatten_payload(field: &Field, out: &mut Vec<u8>) {
    match field {
        Field::Bool(items) => {
            for &item in items {
                out.push(item as u8);
            }
        }
        Field::Int8(items) => {
            for &item in items {
                out.push(item as u8);
            }
        }
        Field::UInt8(items) => out.extend_from_slice(items),
        Field::Int16(items) => {
            for &item in items {
                let mut buf = [0u8; 2];
                LittleEndian::write_i16(&mut buf, item);
                out.extend_from_slice(&buf);
            }
        }
        Field::UInt16(items) => {
            for &item in items {
                let mut buf = [0u8; 2];
                LittleEndian::write_u16(&mut buf, item);
                out.extend_from_slice(&buf);
            }
        }
        Field::Int32(items) => {
            for &item in items {
                push_u32(out, item as u32);
            }
        }
        Field::UInt32(items) => {
            for &item in items {
                push_u32(out, item);
            }
        }
        Field::Int64(items) => {
            for &item in items {
                let mut buf = [0u8; 8];
                LittleEndian::write_i64(&mut buf, item);
                out.extend_from_slice(&buf);
            }
        }
        Field::UInt64(items) => {
            for &item in items {
                let mut buf = [0u8; 8];
                LittleEndian::write_u64(&mut buf, item);
                out.extend_from_slice(&buf);
            }
        }
        Field::Float(items) => {
            for &item in items {
                push_u32(out, item.to_bits());
            }
        }
        Field::Double(items) => {
            for &item in items {
                let mut buf = [0u8; 8];
                LittleEndian::write_u64(&mut buf, item.to_bits());
                out.extend_from_slice(&buf);
            }
        }
        Field::Point(items) => {
            for item in items {
                push_u32(out, item.x.to_bits());
                push_u32(out, item.y.to_bits());
            }
        }
        Field::Rect(items) => {
            for item in items {
                push_u32(out, item.left.to_bits());
                push_u32(out, item.top.to_bits());
                push_u32(out, item.right.to_bits());
                push_u32(out, item.bottom.to_bits());
            }
        }
        Field::Str(items) => {
            push_u32(out, items.len() as u32);
            for item in items {
                out.extend_from_slice(item.as_bytes());
                out.push(0);
            }
        }
        Field::Message(items) => {
            push_u32(out, items.len() as u32);
            for item in items {
                push_u32(out, flattened_size(item));
                flatten_into(item, out);
            }
        }
        Field::Data(_, items) => {
            push_u32(out, items.len() as u32);
            for item in items {
                push_u32(out, item.len() as u32);
                out.extend_from_slice(item);
            }
        }
    }
}

/// Order-dependent rolling checksum over the flattened content, excluding the
/// leading protocol tag. Used for tree-diff hints, not integrity.
pub fn checksum(msg: &Message) -> u32 {
    let bytes = flatten(msg);

    checksum_bytes(&bytes[4..])
}

#[inline]
pub fn checksum_bytes(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |sum, &b| sum.rotate_left(1) ^ u32::from(b))
}

/// Decodes a flattened message, validating every length header against the
/// remaining input. Trailing bytes after the message are rejected.
pub fn unflatten(data: &[u8]) -> Result<Message> {
    unflatten_at_depth(data, 0)
}

fn unflatten_at_depth(data: &[u8], depth: usize) -> Result<Message> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(Error::BadData);
    }

    let mut reader = WireReader::new(data);

    if reader.read_u32()? != PROTOCOL_VERSION_TAG {
        return Err(Error::BadData);
    }

    let mut msg = Message::new(reader.read_u32()?);
    let num_fields = reader.read_u32()? as usize;

    // Each field occupies at least 13 bytes; anything claiming more fields
    // than could fit is a malformed (or hostile) header.
    if num_fields > reader.remaining() / 13 {
        return Err(Error::BadData);
    }

    for _ in 0..num_fields {
        let name_len = reader.read_u32()? as usize;

        if name_len == 0 {
            return Err(Error::BadData);
        }

        let name_bytes = reader.read_bytes(name_len)?;

        if name_bytes[name_len - 1] != 0 {
            return Err(Error::BadData);
        }

        let name = std::str::from_utf8(&name_bytes[..name_len - 1]).map_err(|_| Error::BadData)?;

        if msg.has_field(name) {
            return Err(Error::BadData);
        }

        let type_code = reader.read_u32()?;
        let payload_len = reader.read_u32()? as usize;
        let payload = reader.read_bytes(payload_len)?;

        let field = unflatten_payload(type_code, payload, depth)?;
        msg.put_field(name, field);
    }

    if reader.remaining() != 0 {
        return Err(Error::BadData);
    }

    Ok(msg)
}

fn unflatten_payload(type_code: u32, payload: &[u8], depth: usize) -> Result<Field> {
    match type_code {
        TYPE_BOOL => Ok(Field::Bool(payload.iter().map(|&b| b != 0).collect())),
        TYPE_INT8 => Ok(Field::Int8(payload.iter().map(|&b| b as i8).collect())),
        TYPE_UINT8 => Ok(Field::UInt8(payload.to_vec())),
        TYPE_INT16 => Ok(Field::Int16(read_scalars(payload, 2, LittleEndian::read_i16)?)),
        TYPE_UINT16 => Ok(Field::UInt16(read_scalars(payload, 2, LittleEndian::read_u16)?)),
        TYPE_INT32 => Ok(Field::Int32(read_scalars(payload, 4, LittleEndian::read_i32)?)),
        TYPE_UINT32 => Ok(Field::UInt32(read_scalars(payload, 4, LittleEndian::read_u32)?)),
        TYPE_INT64 => Ok(Field::Int64(read_scalars(payload, 8, LittleEndian::read_i64)?)),
        TYPE_UINT64 => Ok(Field::UInt64(read_scalars(payload, 8, LittleEndian::read_u64)?)),
        TYPE_FLOAT => Ok(Field::Float(read_scalars(payload, 4, |b| {
            f32::from_bits(LittleEndian::read_u32(b))
        })?)),
        TYPE_DOUBLE => Ok(Field::Double(read_scalars(payload, 8, |b| {
            f64::from_bits(LittleEndian::read_u64(b))
        })?)),
        TYPE_POINT => Ok(Field::Point(read_scalars(payload, 8, |b| Point {
            x: f32::from_bits(LittleEndian::read_u32(&b[0..4])),
            y: f32::from_bits(LittleEndian::read_u32(&b[4..8])),
        })?)),
        TYPE_RECT => Ok(Field::Rect(read_scalars(payload, 16, |b| Rect {
            left: f32::from_bits(LittleEndian::read_u32(&b[0..4])),
            top: f32::from_bits(LittleEndian::read_u32(&b[4..8])),
            right: f32::from_bits(LittleEndian::read_u32(&b[8..12])),
            bottom: f32::from_bits(LittleEndian::read_u32(&b[12..16])),
        })?)),
        TYPE_STRING => read_strings(payload),
        TYPE_MESSAGE => read_messages(payload, depth),
        code if is_printable_fourcc(code) => read_blobs(code, payload),
        _ => Err(Error::BadData),
    }
}

fn read_scalars<T, F: Fn(&[u8]) -> T>(payload: &[u8], size: usize, read: F) -> Result<Vec<T>> {
    if payload.len() % size != 0 {
        return Err(Error::BadData);
    }

    Ok(payload.chunks_exact(size).map(|chunk| read(chunk)).collect())
}

fn read_strings(payload: &[u8]) -> Result<Field> {
    let mut reader = WireReader::new(payload);
    let count = reader.read_u32()? as usize;

    if count > reader.remaining() {
        return Err(Error::BadData);
    }

    let mut items = Vec::with_capacity(count);

    for _ in 0..count {
        let bytes = reader.read_until_nul()?;
        let item = std::str::from_utf8(bytes).map_err(|_| Error::BadData)?;
        items.push(item.to_owned());
    }

    if reader.remaining() != 0 {
        return Err(Error::BadData);
    }

    Ok(Field::Str(items))
}

fn read_messages(payload: &[u8], depth: usize) -> Result<Field> {
    let mut reader = WireReader::new(payload);
    let count = reader.read_u32()? as usize;

    if count > reader.remaining() / 12 {
        return Err(Error::BadData);
    }

    let mut items = Vec::with_capacity(count);

    for _ in 0..count {
        let len = reader.read_u32()? as usize;
        let bytes = reader.read_bytes(len)?;
        items.push(MessageRef::detached(unflatten_at_depth(bytes, depth + 1)?));
    }

    if reader.remaining() != 0 {
        return Err(Error::BadData);
    }

    Ok(Field::Message(items))
}

fn read_blobs(type_code: u32, payload: &[u8]) -> Result<Field> {
    let mut reader = WireReader::new(payload);
    let count = reader.read_u32()? as usize;

    if count > reader.remaining() / 4 {
        return Err(Error::BadData);
    }

    let mut items = Vec::with_capacity(count);

    for _ in 0..count {
        let len = reader.read_u32()? as usize;
        items.push(reader.read_bytes(len)?.to_vec());
    }

    if reader.remaining() != 0 {
        return Err(Error::BadData);
    }

    Ok(Field::Data(type_code, items))
}

/// Blob type tags must be printable fourcc codes; anything else is treated as
/// a corrupt stream rather than an opaque extension.
fn is_printable_fourcc(code: u32) -> bool {
    code.to_be_bytes().iter().all(|b| (0x20..0x7f).contains(b))
}

struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(data: &'a [u8]) -> WireReader<'a> {
        WireReader { data, pos: 0 }
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_u32(&mut self) -> Result<u32> {
        if self.remaining() < 4 {
            return Err(Error::BadData);
        }

        let value = LittleEndian::read_u32(&self.data[self.pos..]);
        self.pos += 4;
        Ok(value)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::BadData);
        }

        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Reads up to and including the next NUL, returning the bytes before it.
    fn read_until_nul(&mut self) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];

        match rest.iter().position(|&b| b == 0) {
            Some(idx) => {
                self.pos += idx + 1;
                Ok(&rest[..idx])
            }
            None => Err(Error::BadData),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TYPE_RAW;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn le(value: u32) -> [u8; 4] {
        value.to_le_bytes()
    }

    #[test]
    fn test_flatten_layout_byte_for_byte() {
        let mut msg = Message::new(1234);
        msg.add_i32("nums", 1).unwrap();
        msg.add_i32("nums", -2).unwrap();
        msg.add_i32("nums", 3).unwrap();
        msg.add_string("name", "muscle").unwrap();
        msg.add_message_value("sub", Message::new(7)).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&le(PROTOCOL_VERSION_TAG));
        expected.extend_from_slice(&le(1234));
        expected.extend_from_slice(&le(3));

        // "nums": three little-endian int32s
        expected.extend_from_slice(&le(5));
        expected.extend_from_slice(b"nums\0");
        expected.extend_from_slice(&le(TYPE_INT32));
        expected.extend_from_slice(&le(12));
        expected.extend_from_slice(&le(1));
        expected.extend_from_slice(&le(0xFFFF_FFFE));
        expected.extend_from_slice(&le(3));

        // "name": count then NUL-terminated string
        expected.extend_from_slice(&le(5));
        expected.extend_from_slice(b"name\0");
        expected.extend_from_slice(&le(TYPE_STRING));
        expected.extend_from_slice(&le(11));
        expected.extend_from_slice(&le(1));
        expected.extend_from_slice(b"muscle\0");

        // "sub": count, then per-item length and flattened body
        expected.extend_from_slice(&le(4));
        expected.extend_from_slice(b"sub\0");
        expected.extend_from_slice(&le(TYPE_MESSAGE));
        expected.extend_from_slice(&le(20));
        expected.extend_from_slice(&le(1));
        expected.extend_from_slice(&le(12));
        expected.extend_from_slice(&le(PROTOCOL_VERSION_TAG));
        expected.extend_from_slice(&le(7));
        expected.extend_from_slice(&le(0));

        let bytes = flatten(&msg);

        assert_eq!(bytes, expected);
        assert_eq!(bytes.len(), flattened_size(&msg) as usize);
        assert_eq!(unflatten(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_roundtrip_all_types() {
        let mut msg = Message::new(0xDEAD_BEEF);
        msg.add_bool("b", true).unwrap();
        msg.add_bool("b", false).unwrap();
        msg.add_i8("i8", -5).unwrap();
        msg.add_i16("i16", -500).unwrap();
        msg.add_i32("i32", -70_000).unwrap();
        msg.add_i64("i64", -5_000_000_000).unwrap();
        msg.add_u8("u8", 200).unwrap();
        msg.add_u16("u16", 60_000).unwrap();
        msg.add_u32("u32", 4_000_000_000).unwrap();
        msg.add_u64("u64", u64::max_value()).unwrap();
        msg.add_f32("f32", 1.5).unwrap();
        msg.add_f64("f64", -2.25e100).unwrap();
        msg.add_string("s", "").unwrap();
        msg.add_string("s", "two").unwrap();
        msg.add_point("pt", Point { x: 1.0, y: -2.0 }).unwrap();
        msg.add_rect("rc", Rect { left: 0.0, top: 1.0, right: 2.0, bottom: 3.0 })
            .unwrap();
        msg.add_data("raw", TYPE_RAW, &[0, 1, 2, 255]).unwrap();

        let mut inner = Message::new(99);
        inner.add_string("deep", "value").unwrap();
        msg.add_message_value("m", inner).unwrap();

        let decoded = unflatten(&flatten(&msg)).unwrap();

        assert_eq!(decoded, msg);

        // Field order must survive the trip
        let names: Vec<&str> = decoded.iter().map(|(name, _)| name).collect();
        let expected: Vec<&str> = msg.iter().map(|(name, _)| name).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_roundtrip_empty_message() {
        let msg = Message::new(0);
        let bytes = flatten(&msg);

        assert_eq!(bytes.len(), 12);
        assert_eq!(unflatten(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_unflatten_rejects_bad_magic() {
        let mut bytes = flatten(&Message::new(1));
        bytes[0] ^= 0xFF;

        assert_eq!(unflatten(&bytes).unwrap_err(), Error::BadData);
    }

    #[test]
    fn test_unflatten_rejects_truncation() {
        let mut msg = Message::new(1);
        msg.add_string("s", "hello").unwrap();
        let bytes = flatten(&msg);

        for len in 0..bytes.len() {
            assert_eq!(unflatten(&bytes[..len]).unwrap_err(), Error::BadData);
        }
    }

    #[test]
    fn test_unflatten_rejects_trailing_garbage() {
        let mut bytes = flatten(&Message::new(1));
        bytes.push(0);

        assert_eq!(unflatten(&bytes).unwrap_err(), Error::BadData);
    }

    #[test]
    fn test_unflatten_rejects_overlong_field_count() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&le(PROTOCOL_VERSION_TAG));
        bytes.extend_from_slice(&le(1));
        bytes.extend_from_slice(&le(u32::max_value()));

        assert_eq!(unflatten(&bytes).unwrap_err(), Error::BadData);
    }

    #[test]
    fn test_unflatten_rejects_unknown_type_code() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&le(PROTOCOL_VERSION_TAG));
        bytes.extend_from_slice(&le(1));
        bytes.extend_from_slice(&le(1));
        bytes.extend_from_slice(&le(2));
        bytes.extend_from_slice(b"x\0");
        bytes.extend_from_slice(&le(0x0000_0001)); // not a printable fourcc
        bytes.extend_from_slice(&le(0));

        assert_eq!(unflatten(&bytes).unwrap_err(), Error::BadData);
    }

    #[test]
    fn test_unflatten_rejects_misaligned_scalars() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&le(PROTOCOL_VERSION_TAG));
        bytes.extend_from_slice(&le(1));
        bytes.extend_from_slice(&le(1));
        bytes.extend_from_slice(&le(2));
        bytes.extend_from_slice(b"x\0");
        bytes.extend_from_slice(&le(TYPE_INT32));
        bytes.extend_from_slice(&le(3));
        bytes.extend_from_slice(&[0, 0, 0]);

        assert_eq!(unflatten(&bytes).unwrap_err(), Error::BadData);
    }

    #[test]
    fn test_unflatten_rejects_unterminated_name() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&le(PROTOCOL_VERSION_TAG));
        bytes.extend_from_slice(&le(1));
        bytes.extend_from_slice(&le(1));
        bytes.extend_from_slice(&le(2));
        bytes.extend_from_slice(b"xy"); // no NUL
        bytes.extend_from_slice(&le(TYPE_BOOL));
        bytes.extend_from_slice(&le(0));

        assert_eq!(unflatten(&bytes).unwrap_err(), Error::BadData);
    }

    #[test]
    fn test_unflatten_rejects_excessive_nesting() {
        let mut msg = Message::new(0);
        for _ in 0..70 {
            let mut outer = Message::new(0);
            outer.add_message_value("m", msg).unwrap();
            msg = outer;
        }

        assert_eq!(unflatten(&flatten(&msg)).unwrap_err(), Error::BadData);
    }

    #[test]
    fn test_checksum_is_order_dependent() {
        let mut a = Message::new(1);
        a.add_string("x", "one").unwrap();
        a.add_string("y", "two").unwrap();

        let mut b = Message::new(1);
        b.add_string("y", "two").unwrap();
        b.add_string("x", "one").unwrap();

        assert_ne!(checksum(&a), checksum(&b));
        assert_eq!(checksum(&a), checksum(&a.clone()));
    }

    #[test]
    fn test_randomized_roundtrip() {
        let mut rng = StdRng::seed_from_u64(0x0A55);

        for _ in 0..50 {
            let mut msg = Message::new(rng.gen());

            for f in 0..rng.gen_range(0..8) {
                let name = format!("field{}", f);
                match rng.gen_range(0..6) {
                    0 => {
                        for _ in 0..rng.gen_range(0..5) {
                            msg.add_i32(&name, rng.gen()).unwrap();
                        }
                    }
                    1 => {
                        for _ in 0..rng.gen_range(0..5) {
                            msg.add_u64(&name, rng.gen()).unwrap();
                        }
                    }
                    2 => {
                        for _ in 0..rng.gen_range(0..5) {
                            msg.add_f64(&name, rng.gen()).unwrap();
                        }
                    }
                    3 => {
                        for i in 0..rng.gen_range(0..5) {
                            msg.add_string(&name, &format!("str-{}", i)).unwrap();
                        }
                    }
                    4 => {
                        for _ in 0..rng.gen_range(0..3) {
                            let blob: Vec<u8> = (0..rng.gen_range(0..32)).map(|_| rng.gen()).collect();
                            msg.add_data(&name, TYPE_RAW, &blob).unwrap();
                        }
                    }
                    _ => {
                        let mut inner = Message::new(rng.gen());
                        inner.add_bool("leaf", rng.gen()).unwrap();
                        msg.add_message_value(&name, inner).unwrap();
                    }
                }
            }

            assert_eq!(unflatten(&flatten(&msg)).unwrap(), msg);
        }
    }
}
