use crate::pool::{PoolRef, Reusable};
use crate::support::{Error, Result};
use indexmap::IndexMap;

/// Shared handle to a message. Payloads in the node tree and entries in the
/// outgoing queues are always passed around as these.
pub type MessageRef = PoolRef<Message>;

/// Builds a printable four-character type tag.
pub const fn fourcc(code: [u8; 4]) -> u32 {
    u32::from_be_bytes(code)
}

pub const TYPE_BOOL: u32 = fourcc(*b"BOOL");
pub const TYPE_INT8: u32 = fourcc(*b"CHAR");
pub const TYPE_INT16: u32 = fourcc(*b"SHRT");
pub const TYPE_INT32: u32 = fourcc(*b"LONG");
pub const TYPE_INT64: u32 = fourcc(*b"LLNG");
pub const TYPE_UINT8: u32 = fourcc(*b"UBYT");
pub const TYPE_UINT16: u32 = fourcc(*b"USHT");
pub const TYPE_UINT32: u32 = fourcc(*b"ULNG");
pub const TYPE_UINT64: u32 = fourcc(*b"ULLG");
pub const TYPE_FLOAT: u32 = fourcc(*b"FLOT");
pub const TYPE_DOUBLE: u32 = fourcc(*b"DBLE");
pub const TYPE_STRING: u32 = fourcc(*b"CSTR");
pub const TYPE_POINT: u32 = fourcc(*b"BPNT");
pub const TYPE_RECT: u32 = fourcc(*b"RECT");
pub const TYPE_MESSAGE: u32 = fourcc(*b"MSGG");
pub const TYPE_RAW: u32 = fourcc(*b"RAWT");

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

/// One named field: a homogeneous vector of values. Blob fields carry their
/// own application type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Bool(Vec<bool>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Str(Vec<String>),
    Point(Vec<Point>),
    Rect(Vec<Rect>),
    Message(Vec<MessageRef>),
    Data(u32, Vec<Vec<u8>>),
}

impl Field {
    pub fn type_code(&self) -> u32 {
        match self {
            Field::Bool(_) => TYPE_BOOL,
            Field::Int8(_) => TYPE_INT8,
            Field::Int16(_) => TYPE_INT16,
            Field::Int32(_) => TYPE_INT32,
            Field::Int64(_) => TYPE_INT64,
            Field::UInt8(_) => TYPE_UINT8,
            Field::UInt16(_) => TYPE_UINT16,
            Field::UInt32(_) => TYPE_UINT32,
            Field::UInt64(_) => TYPE_UINT64,
            Field::Float(_) => TYPE_FLOAT,
            Field::Double(_) => TYPE_DOUBLE,
            Field::Str(_) => TYPE_STRING,
            Field::Point(_) => TYPE_POINT,
            Field::Rect(_) => TYPE_RECT,
            Field::Message(_) => TYPE_MESSAGE,
            Field::Data(code, _) => *code,
        }
    }

    /// Number of items in the field.
    pub fn len(&self) -> usize {
        match self {
            Field::Bool(items) => items.len(),
            Field::Int8(items) => items.len(),
            Field::Int16(items) => items.len(),
            Field::Int32(items) => items.len(),
            Field::Int64(items) => items.len(),
            Field::UInt8(items) => items.len(),
            Field::UInt16(items) => items.len(),
            Field::UInt32(items) => items.len(),
            Field::UInt64(items) => items.len(),
            Field::Float(items) => items.len(),
            Field::Double(items) => items.len(),
            Field::Str(items) => items.len(),
            Field::Point(items) => items.len(),
            Field::Rect(items) => items.len(),
            Field::Message(items) => items.len(),
            Field::Data(_, items) => items.len(),
        }
    }
}

macro_rules! scalar_field_api {
    ($add:ident, $get:ident, $first:ident, $variant:ident, $ty:ty) => {
        pub fn $add(&mut self, name: &str, value: $ty) -> Result<()> {
            match self
                .fields
                .entry(name.to_owned())
                .or_insert_with(|| Field::$variant(Vec::new()))
            {
                Field::$variant(items) => {
                    items.push(value);
                    Ok(())
                }
                _ => Err(Error::BadObject),
            }
        }

        pub fn $get(&self, name: &str) -> Result<&[$ty]> {
            match self.fields.get(name) {
                Some(Field::$variant(items)) => Ok(items),
                Some(_) => Err(Error::BadObject),
                None => Err(Error::DataNotFound),
            }
        }

        pub fn $first(&self, name: &str) -> Result<$ty> {
            self.$get(name)?.first().copied().ok_or(Error::DataNotFound)
        }
    };
}

/// A self-describing dictionary: a 32-bit what-code plus named, typed value
/// vectors. Field order is preserved across flatten/unflatten.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    what: u32,
    fields: IndexMap<String, Field>,
}

impl Message {
    #[inline]
    pub fn new(what: u32) -> Message {
        Message {
            what,
            fields: IndexMap::new(),
        }
    }

    #[inline]
    pub fn what(&self) -> u32 {
        self.what
    }

    #[inline]
    pub fn set_what(&mut self, what: u32) {
        self.what = what;
    }

    #[inline]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    #[inline]
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Iterates fields in insertion order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(name, field)| (name.as_str(), field))
    }

    /// Removes a field entirely. Later fields keep their relative order.
    pub fn remove_field(&mut self, name: &str) -> Result<()> {
        match self.fields.shift_remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::DataNotFound),
        }
    }

    /// Installs a fully built field, replacing any previous one of that name.
    pub fn put_field(&mut self, name: &str, field: Field) {
        self.fields.insert(name.to_owned(), field);
    }

    scalar_field_api!(add_bool, get_bools, first_bool, Bool, bool);
    scalar_field_api!(add_i8, get_i8s, first_i8, Int8, i8);
    scalar_field_api!(add_i16, get_i16s, first_i16, Int16, i16);
    scalar_field_api!(add_i32, get_i32s, first_i32, Int32, i32);
    scalar_field_api!(add_i64, get_i64s, first_i64, Int64, i64);
    scalar_field_api!(add_u8, get_u8s, first_u8, UInt8, u8);
    scalar_field_api!(add_u16, get_u16s, first_u16, UInt16, u16);
    scalar_field_api!(add_u32, get_u32s, first_u32, UInt32, u32);
    scalar_field_api!(add_u64, get_u64s, first_u64, UInt64, u64);
    scalar_field_api!(add_f32, get_f32s, first_f32, Float, f32);
    scalar_field_api!(add_f64, get_f64s, first_f64, Double, f64);
    scalar_field_api!(add_point, get_points, first_point, Point, Point);
    scalar_field_api!(add_rect, get_rects, first_rect, Rect, Rect);

    /// Strings may not contain NUL; the wire encoding is NUL-delimited.
    pub fn add_string(&mut self, name: &str, value: &str) -> Result<()> {
        if value.as_bytes().contains(&0) {
            return Err(Error::BadArgument);
        }

        match self
            .fields
            .entry(name.to_owned())
            .or_insert_with(|| Field::Str(Vec::new()))
        {
            Field::Str(items) => {
                items.push(value.to_owned());
                Ok(())
            }
            _ => Err(Error::BadObject),
        }
    }

    pub fn get_strings(&self, name: &str) -> Result<&[String]> {
        match self.fields.get(name) {
            Some(Field::Str(items)) => Ok(items),
            Some(_) => Err(Error::BadObject),
            None => Err(Error::DataNotFound),
        }
    }

    pub fn first_string(&self, name: &str) -> Result<&str> {
        self.get_strings(name)?
            .first()
            .map(String::as_str)
            .ok_or(Error::DataNotFound)
    }

    pub fn add_message(&mut self, name: &str, value: MessageRef) -> Result<()> {
        match self
            .fields
            .entry(name.to_owned())
            .or_insert_with(|| Field::Message(Vec::new()))
        {
            Field::Message(items) => {
                items.push(value);
                Ok(())
            }
            _ => Err(Error::BadObject),
        }
    }

    /// Convenience wrapper for messages built on the stack.
    pub fn add_message_value(&mut self, name: &str, value: Message) -> Result<()> {
        self.add_message(name, MessageRef::detached(value))
    }

    pub fn get_messages(&self, name: &str) -> Result<&[MessageRef]> {
        match self.fields.get(name) {
            Some(Field::Message(items)) => Ok(items),
            Some(_) => Err(Error::BadObject),
            None => Err(Error::DataNotFound),
        }
    }

    pub fn first_message(&self, name: &str) -> Result<&MessageRef> {
        self.get_messages(name)?.first().ok_or(Error::DataNotFound)
    }

    /// Appends an opaque blob tagged with an application type code. All blobs
    /// under one name must share the tag.
    pub fn add_data(&mut self, name: &str, type_code: u32, bytes: &[u8]) -> Result<()> {
        match self
            .fields
            .entry(name.to_owned())
            .or_insert_with(|| Field::Data(type_code, Vec::new()))
        {
            Field::Data(code, items) if *code == type_code => {
                items.push(bytes.to_vec());
                Ok(())
            }
            _ => Err(Error::BadObject),
        }
    }

    pub fn get_data(&self, name: &str, type_code: u32) -> Result<&[Vec<u8>]> {
        match self.fields.get(name) {
            Some(Field::Data(code, items)) if *code == type_code => Ok(items),
            Some(_) => Err(Error::BadObject),
            None => Err(Error::DataNotFound),
        }
    }
}

impl Reusable for Message {
    fn reset(&mut self) {
        self.what = 0;
        self.fields.clear();
    }
}
