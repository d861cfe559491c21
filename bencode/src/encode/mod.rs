use serde::ser;
use crate::{Error, Result, Value};

mod encoder;
mod map;
mod string;


pub fn encode_to_raw<T: ser::Serialize>(v: &T) -> Result<Vec<u8>> {
    let mut encoder = encoder::Encoder::new();
    v.serialize(&mut encoder)?;
    Ok(encoder.into_buf())
}

pub fn encode_to_str<T: ser::Serialize>(v: &T) -> Result<String> {
    String::from_utf8(encode_to_raw(v)?)
        .map_err(|_| Error::Custom("invalid utf-8 string".to_string()))
}

pub fn encode(v: &Value) -> Result<Vec<u8>> {
    encode_to_raw(v)
}
