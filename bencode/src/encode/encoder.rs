use serde::ser::{self, Serialize, Serializer as _};
use crate::{Error, Result};
use super::map::Dict;

// Writes bencode into an owned buffer.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {

    pub fn new() -> Self { Self::default() }

    pub fn into_buf(self) -> Vec<u8> { self.buf }

    pub(super) fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    // i<base ten>e
    fn int(&mut self, v: i64) {
        self.buf.push(b'i');
        self.buf.extend_from_slice(v.to_string().as_bytes());
        self.buf.push(b'e');
    }

    // <length>:<contents>
    pub(super) fn byte_string(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v.len().to_string().as_bytes());
        self.buf.push(b':');
        self.buf.extend_from_slice(v);
    }

    // Opens the single entry dict that wraps an enum variant.
    fn variant_key(&mut self, variant: &str) {
        self.buf.push(b'd');
        self.byte_string(variant.as_bytes());
    }
}

// Integers narrower than i64 all encode the same way.
macro_rules! encode_as_i64 {
    ($($method:ident: $ty:ty),*) => {$(
        fn $method(self, v: $ty) -> Result<()> {
            self.int(v as i64);
            Ok(())
        }
    )*};
}

impl<'a> ser::Serializer for &'a mut Encoder {

    type Ok     = ();
    type Error  = Error;

    type SerializeSeq           = Self;
    type SerializeTuple         = Self;
    type SerializeTupleStruct   = Self;
    type SerializeTupleVariant  = Self;
    type SerializeMap           = Dict<'a>;
    type SerializeStruct        = Dict<'a>;
    type SerializeStructVariant = Dict<'a>;

    encode_as_i64!(
        serialize_bool: bool,
        serialize_i8: i8,
        serialize_i16: i16,
        serialize_i32: i32,
        serialize_i64: i64,
        serialize_u8: u8,
        serialize_u16: u16,
        serialize_u32: u32
    );

    fn serialize_u64(self, v: u64) -> Result<()> {
        let v = i64::try_from(v).map_err(|_| Error::InvalidType(format!("integer {} out of range", v)))?;
        self.int(v);
        Ok(())
    }

    fn serialize_f32(self, _: f32) -> Result<()> {
        Err(Error::InvalidType("f32".to_string()))
    }

    fn serialize_f64(self, _: f64) -> Result<()> {
        Err(Error::InvalidType("f64".to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<()> {
        self.byte_string(v);
        Ok(())
    }

    fn serialize_str(self, v: &str) -> Result<()> {
        self.serialize_bytes(v.as_bytes())
    }

    fn serialize_char(self, v: char) -> Result<()> {
        self.serialize_str(v.encode_utf8(&mut [0; 4]))
    }

    // Absent values write nothing, a dict then drops the entry.
    fn serialize_none(self) -> Result<()> { Ok(()) }

    fn serialize_unit(self) -> Result<()> { Ok(()) }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<()> { Ok(()) }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<()> {
        value.serialize(self)
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(self, _name: &'static str, value: &T) -> Result<()> {
        value.serialize(self)
    }

    fn serialize_unit_variant(self, _name: &'static str, _idx: u32, variant: &'static str) -> Result<()> {
        self.serialize_str(variant)
    }

    // d<variant><value>e
    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _idx: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<()> {
        self.variant_key(variant);
        value.serialize(&mut *self)?;
        self.raw(b"e");
        Ok(())
    }

    // l<contents>e
    fn serialize_seq(self, _len: Option<usize>) -> Result<Self> {
        self.raw(b"l");
        Ok(self)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self> {
        self.serialize_seq(None)
    }

    fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> Result<Self> {
        self.serialize_seq(None)
    }

    // d<variant>l<contents>ee
    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _idx: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self> {
        self.variant_key(variant);
        self.serialize_seq(None)
    }

    // Entries are written once all keys are known, see `Dict`.
    fn serialize_map(self, _len: Option<usize>) -> Result<Dict<'a>> {
        Ok(Dict::new(self, false))
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Dict<'a>> {
        Ok(Dict::new(self, false))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _idx: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Dict<'a>> {
        self.variant_key(variant);
        Ok(Dict::new(self, true))
    }
}

// Lists and tuples share the same element handling, only the closing differs.
macro_rules! list_like {
    ($trait:ident, $method:ident, $close:expr) => {
        impl ser::$trait for &mut Encoder {
            type Ok = ();
            type Error = Error;

            fn $method<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
                value.serialize(&mut **self)
            }

            fn end(self) -> Result<()> {
                self.raw($close);
                Ok(())
            }
        }
    };
}

list_like!(SerializeSeq, serialize_element, b"e");
list_like!(SerializeTuple, serialize_element, b"e");
list_like!(SerializeTupleStruct, serialize_field, b"e");
// Closes the list and the variant dict.
list_like!(SerializeTupleVariant, serialize_field, b"ee");
