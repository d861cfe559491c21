use serde::{Deserializer, de};

use crate::error::{Error, Result};
use super::decoder::Decoder;
use super::DecodedType;

// Walks the elements of a list or dict, start is the offset of its opening byte.
pub struct Access<'a, 'de: 'a> {
    d:      &'a mut Decoder<'de>,
    start:  usize,
}

impl<'a, 'de> Access<'a, 'de> {
    pub fn new(deserializer: &'a mut Decoder<'de>, start: usize) -> Self {
        Self { d: deserializer, start }
    }
}

impl<'de, 'a> de::SeqAccess<'de> for Access<'a, 'de> {
    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>>
        where T: de::DeserializeSeed<'de> 
    {
        match self.d.read_in_container(self.start)? {
            DecodedType::End => Ok(None),
            x => {
                self.d.put_back(x);
                Ok(Some(seed.deserialize(&mut *self.d)?))
            },
        }
    }
}

impl<'de, 'a> de::MapAccess<'de> for Access<'a, 'de> {
    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>>
        where K: de::DeserializeSeed<'de> 
    {
        match self.d.read_in_container(self.start)? {
            DecodedType::End => Ok(None),
            x @ DecodedType::ByteString(_) => {
                self.d.put_back(x);
                Ok(Some(seed.deserialize(&mut *self.d)?))
            },
            _ => Err(Error::UnexpectedToken { expected: "byte string key", offset: self.d.token_start() }),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value>
        where V: de::DeserializeSeed<'de> 
    {
        match self.d.read_in_container(self.start)? {
            DecodedType::End => Err(Error::UnexpectedToken { expected: "dictionary value", offset: self.d.token_start() }),
            x => {
                self.d.put_back(x);
                seed.deserialize(&mut *self.d)
            },
        }
    }    
}

impl<'de, 'a> de::VariantAccess<'de> for Access<'a, 'de> {
    type Error = Error;

    fn unit_variant(self) -> Result<()> { Ok(()) }

    fn newtype_variant_seed<T>(self, seed: T) -> Result<T::Value>
        where T: de::DeserializeSeed<'de>
    {
        let out = seed.deserialize(&mut *self.d)?;
        self.d.expect_end(self.start)?;
        Ok(out)
    }

    fn tuple_variant<V>(self, len: usize, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de> 
    {
        let out = Deserializer::deserialize_tuple(&mut *self.d, len, visitor)?;
        self.d.expect_end(self.start)?;
        Ok(out)
    }

    fn struct_variant<V>(
            self,
            _fields: &'static [&'static str],
            visitor: V,
        ) -> Result<V::Value>
        where V: de::Visitor<'de> 
    {
        let out = Deserializer::deserialize_any(&mut *self.d, visitor)?;
        self.d.expect_end(self.start)?;
        Ok(out)
    }
}

impl<'de, 'a> de::EnumAccess<'de> for Access<'a, 'de> {
    type Error = Error;
    type Variant = Self;
    
    fn variant_seed<V>(self, seed: V) -> Result<(V::Value, Self::Variant)>
        where V: de::DeserializeSeed<'de> 
    {
        match self.d.read_next()? {

            // Unit variant encoded as its name.
            b @ DecodedType::ByteString(_) => {
                self.d.put_back(b);
                Ok((seed.deserialize(&mut *self.d)?, self))
            },

            // Other variants are a single entry dict of name -> value.
            DecodedType::Dictionary => {
                let start = self.d.token_start();
                let variant = seed.deserialize(&mut *self.d)?;
                Ok((variant, Access::new(self.d, start)))
            },
            
            _ => Err(Error::UnexpectedToken { expected: "byte string or dict", offset: self.d.token_start() }),
        }
    }
}
