use serde::ser::{self, Serializer as _};
use crate::{Error, Result};

// Dictionary keys must be byte strings, anything else is rejected.
// Produces the raw key bytes, the map writes the length prefix on finish.
pub struct StringSerializer;

fn not_a_key<T>(kind: &str) -> Result<T> {
    Err(Error::InvalidType(format!("dictionary key must be a string, found {}", kind)))
}

impl<'a> ser::Serializer for &'a mut StringSerializer {

    type Ok     = Vec<u8>;
    type Error  = Error;

    type SerializeSeq           = ser::Impossible<Vec<u8>, Error>;
    type SerializeMap           = ser::Impossible<Vec<u8>, Error>;
    type SerializeStruct        = ser::Impossible<Vec<u8>, Error>;
    type SerializeStructVariant = ser::Impossible<Vec<u8>, Error>;
    type SerializeTuple         = ser::Impossible<Vec<u8>, Error>;
    type SerializeTupleStruct   = ser::Impossible<Vec<u8>, Error>;
    type SerializeTupleVariant  = ser::Impossible<Vec<u8>, Error>;

    fn serialize_bytes(self, v: &[u8]) -> Result<Vec<u8>> { Ok(v.to_vec()) }

    fn serialize_str(self, v: &str) -> Result<Vec<u8>> { Ok(v.as_bytes().to_vec()) }

    fn serialize_char(self, v: char) -> Result<Vec<u8>> {
        let mut buf = [0; 4];
        self.serialize_str(v.encode_utf8(&mut buf))
    }

    fn serialize_unit_variant(
            self,
            _name: &'static str,
            _variant_index: u32,
            variant: &'static str,
        ) -> Result<Vec<u8>>
    {
        self.serialize_str(variant)
    }

    fn serialize_newtype_struct<T: ?Sized>(
            self,
            _name: &'static str,
            value: &T,
        ) -> Result<Vec<u8>>
        where T: serde::Serialize
    {
        value.serialize(self)
    }

    fn serialize_bool(self, _: bool) -> Result<Vec<u8>> { not_a_key("bool") }
    fn serialize_i8(self, _: i8) -> Result<Vec<u8>> { not_a_key("integer") }
    fn serialize_i16(self, _: i16) -> Result<Vec<u8>> { not_a_key("integer") }
    fn serialize_i32(self, _: i32) -> Result<Vec<u8>> { not_a_key("integer") }
    fn serialize_i64(self, _: i64) -> Result<Vec<u8>> { not_a_key("integer") }
    fn serialize_u8(self, _: u8) -> Result<Vec<u8>> { not_a_key("integer") }
    fn serialize_u16(self, _: u16) -> Result<Vec<u8>> { not_a_key("integer") }
    fn serialize_u32(self, _: u32) -> Result<Vec<u8>> { not_a_key("integer") }
    fn serialize_u64(self, _: u64) -> Result<Vec<u8>> { not_a_key("integer") }
    fn serialize_f32(self, _: f32) -> Result<Vec<u8>> { not_a_key("float") }
    fn serialize_f64(self, _: f64) -> Result<Vec<u8>> { not_a_key("float") }
    fn serialize_none(self) -> Result<Vec<u8>> { not_a_key("none") }
    fn serialize_unit(self) -> Result<Vec<u8>> { not_a_key("unit") }
    fn serialize_unit_struct(self, _: &'static str) -> Result<Vec<u8>> { not_a_key("unit struct") }

    fn serialize_some<T: ?Sized>(self, value: &T) -> Result<Vec<u8>>
        where T: serde::Serialize
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized>(
            self,
            _name: &'static str,
            _variant_index: u32,
            _variant: &'static str,
            _value: &T,
        ) -> Result<Vec<u8>>
        where T: serde::Serialize
    {
        not_a_key("enum")
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq> { not_a_key("list") }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple> { not_a_key("tuple") }

    fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeTupleStruct> {
        not_a_key("tuple struct")
    }

    fn serialize_tuple_variant(
            self,
            _name: &'static str,
            _variant_index: u32,
            _variant: &'static str,
            _len: usize,
        ) -> Result<Self::SerializeTupleVariant>
    {
        not_a_key("enum")
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap> { not_a_key("map") }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeStruct> {
        not_a_key("struct")
    }

    fn serialize_struct_variant(
            self,
            _name: &'static str,
            _variant_index: u32,
            _variant: &'static str,
            _len: usize,
        ) -> Result<Self::SerializeStructVariant>
    {
        not_a_key("enum")
    }
}
