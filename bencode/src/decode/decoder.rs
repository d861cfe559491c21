use serde::{
    de, 
    forward_to_deserialize_any,
    de::Deserializer,
};
use crate::error::{Error, Result};
use super::DecodedType;
use super::access::Access;

// Single pass recursive descent over a byte slice, pos is the cursor.
pub struct Decoder<'de> {
    input:          &'de [u8],
    pos:            usize,
    // Offset of the first byte of the last token read.
    token_start:    usize,
    // Token read ahead by an access and handed back.
    next_token:     Option<(usize, DecodedType<'de>)>,
}

impl<'de> Decoder<'de> {

    pub fn new(input: &'de [u8]) -> Self {
        Self { input, pos: 0, token_start: 0, next_token: None }
    }

    pub fn token_start(&self) -> usize { self.token_start }

    pub fn put_back(&mut self, token: DecodedType<'de>) {
        self.next_token = Some((self.token_start, token));
    }

    pub fn read_next(&mut self) -> Result<DecodedType<'de>> { 
        if let Some((start, next)) = self.next_token.take() {
            self.token_start = start;
            return Ok(next);
        }

        let start = self.pos;
        self.token_start = start;
        let b = *self.input.get(start).ok_or(Error::UnexpectedEof { offset: start })?;

        match b {
            b'i' => {
                self.pos += 1;
                Ok(DecodedType::Integer(self.read_i64()?))
            },
            b'0'..=b'9' => Ok(DecodedType::ByteString(self.read_bytes()?)),
            b'l' => {
                self.pos += 1;
                Ok(DecodedType::List)
            },
            b'd' => {
                self.pos += 1;
                Ok(DecodedType::Dictionary)
            },
            b'e' => {
                self.pos += 1;
                Ok(DecodedType::End)
            },
            found => Err(Error::InvalidToken { offset: start, found: found as char }),
        }
    }

    // Next token inside a list or dict opened at container_start.
    pub fn read_in_container(&mut self, container_start: usize) -> Result<DecodedType<'de>> {
        if self.next_token.is_none() && self.pos >= self.input.len() {
            return Err(Error::MissingTerminator { offset: container_start });
        }
        self.read_next()
    }

    pub fn expect_end(&mut self, container_start: usize) -> Result<()> {
        match self.read_in_container(container_start)? {
            DecodedType::End => Ok(()),
            _ => Err(Error::MissingTerminator { offset: container_start }),
        }
    }

    pub fn finish(&self) -> Result<()> {
        if let Some((offset, _)) = self.next_token {
            return Err(Error::TrailingData { offset });
        }
        if self.pos < self.input.len() {
            return Err(Error::TrailingData { offset: self.pos });
        }
        Ok(())
    }

    // Reads base ten digits up to and including the terminator.
    // Rejects empty numbers, leading zeros and negative zero.
    fn read_digits(&mut self, terminator: u8, signed: bool) -> Result<&'de [u8]> {
        let start = self.pos;
        loop {
            match self.input.get(self.pos) {
                None => return Err(Error::UnexpectedEof { offset: self.pos }),
                Some(&b) if b == terminator => break,
                Some(b'0'..=b'9') => self.pos += 1,
                Some(b'-') if signed && self.pos == start => self.pos += 1,
                Some(_) => return Err(Error::InvalidInteger { offset: self.pos }),
            }
        }

        let digits = &self.input[start..self.pos];
        // Skip terminator.
        self.pos += 1;

        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        if unsigned.is_empty()
            || (unsigned.len() > 1 && unsigned[0] == b'0')
            || (digits[0] == b'-' && unsigned == b"0")
        {
            return Err(Error::InvalidInteger { offset: start });
        }
        Ok(digits)
    }

    fn read_i64(&mut self) -> Result<i64> {
        let start = self.pos;
        let digits = self.read_digits(b'e', true)?;
        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(Error::InvalidInteger { offset: start })
    }

    fn read_bytes(&mut self) -> Result<&'de [u8]> {
        let start = self.pos;
        let digits = self.read_digits(b':', false)?;
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(Error::InvalidInteger { offset: start })?;

        let remaining = self.input.len() - self.pos;
        if len > remaining {
            return Err(Error::LengthOutOfBounds { offset: start, len, remaining });
        }
        let bytes = &self.input[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}

impl<'de, 'a> Deserializer<'de> for &'a mut Decoder<'de> {

    type Error = Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value>
        where V: serde::de::Visitor<'de> 
    {
        let token = self.read_next()?;
        let start = self.token_start;
        match token {
            DecodedType::Integer(i) => visitor.visit_i64(i),
            DecodedType::ByteString(s) => visitor.visit_borrowed_bytes(s),
            DecodedType::List => visitor.visit_seq(Access::new(self, start)),
            DecodedType::Dictionary => visitor.visit_map(Access::new(self, start)),
            DecodedType::End => Err(Error::UnexpectedToken { expected: "a value", offset: start }),
        }
    }

    forward_to_deserialize_any! {
        bool char
        i8 i16 i32 i64
        u8 u16 u32 u64
        f32 f64
        unit bytes byte_buf 
        seq map unit_struct
        ignored_any struct
    }

    fn deserialize_newtype_struct<V>(
            self,
            _name: &'static str,
            visitor: V,
        ) -> Result<V::Value>
        where V: de::Visitor<'de> 
    {
        visitor.visit_newtype_struct(self)    
    }

    // Bencode has no null, a present value is always Some.
    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de> 
    {
        visitor.visit_some(self)    
    }

    fn deserialize_enum<V>(
            self,
            _name: &'static str,
            _variants: &'static [&'static str],
            visitor: V,
        ) -> Result<V::Value>
        where V: de::Visitor<'de> 
    {
        let start = self.pos;
        visitor.visit_enum(Access::new(self, start))   
    }

    fn deserialize_str<V>(self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de> 
    {
        let token = self.read_next()?;
        let start = self.token_start;
        let b = match token {
            DecodedType::ByteString(b) => b,
            _ => return Err(Error::UnexpectedToken { expected: "byte string", offset: start }),
        };

        let s = std::str::from_utf8(b).map_err(|_| Error::InvalidUtf8 { offset: start })?;
        visitor.visit_borrowed_str(s)
    }

    fn deserialize_string<V>(self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de> 
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_tuple<V>(self, _len: usize, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de> 
    {
        let token = self.read_next()?;
        let start = self.token_start;
        if token != DecodedType::List {
            return Err(Error::UnexpectedToken { expected: "list", offset: start });
        }
        let out = visitor.visit_seq(Access::new(&mut *self, start))?;
        // Fixed length visitors stop before the terminator.
        self.expect_end(start)?;
        Ok(out)
    }

    fn deserialize_tuple_struct<V>(
            self,
            _name: &'static str,
            len: usize,
            visitor: V,
        ) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        self.deserialize_tuple(len, visitor)
    }

    fn deserialize_identifier<V>(self, visitor: V) -> Result<V::Value>
    where V: de::Visitor<'de> 
    {
        self.deserialize_str(visitor)
    }
}
