use serde::de;
use crate::{error::Result, Value};

mod decoder;
mod access;

use decoder::Decoder;

#[derive(PartialEq, Eq, Debug)]
pub enum DecodedType<'de> {
    Integer(i64),
    ByteString(&'de [u8]),
    List,
    Dictionary,
    End,
}

// Input must hold exactly one value, trailing bytes are an error.
pub fn decode_bytes<'de, T>(b: &'de [u8]) -> Result<T>
    where T: de::Deserialize<'de>
{
    let mut decoder = Decoder::new(b);
    let value = de::Deserialize::deserialize(&mut decoder)?;
    decoder.finish()?;
    Ok(value)
}

pub fn decode_str<'de, T>(s: &'de str) -> Result<T>
    where T: de::Deserialize<'de> 
{
    decode_bytes(s.as_bytes())
}

pub fn decode(b: &[u8]) -> Result<Value> {
    decode_bytes(b)
}
