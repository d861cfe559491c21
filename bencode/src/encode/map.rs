use std::collections::{btree_map::Entry, BTreeMap};
use serde::ser::{self, Serialize};
use crate::{Error, Result};
use super::{encoder::Encoder, string::StringSerializer};

// Buffers a dictionary so entries come out sorted by raw key bytes,
// whatever order they were serialized in.
pub struct Dict<'a> {
    out: &'a mut Encoder,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    pending_key: Option<Vec<u8>>,
    // Struct variants sit inside an extra dict that needs closing.
    close_variant: bool,
}

fn order_error<T>(msg: &str) -> Result<T> {
    Err(Error::MapSerializationOrder(msg.to_string()))
}

impl<'a> Dict<'a> {

    pub fn new(out: &'a mut Encoder, close_variant: bool) -> Self {
        Self {
            out,
            entries: BTreeMap::new(),
            pending_key: None,
            close_variant,
        }
    }

    fn insert<V: ?Sized + Serialize>(&mut self, key: Vec<u8>, value: &V) -> Result<()> {
        let mut encoded = Encoder::new();
        value.serialize(&mut encoded)?;
        let encoded = encoded.into_buf();
        // None and unit write nothing and leave no entry behind.
        if encoded.is_empty() {
            return Ok(());
        }
        match self.entries.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(encoded);
                Ok(())
            },
            Entry::Occupied(slot) => Err(Error::MapSerializationOrder(
                format!("duplicate key {:?}", String::from_utf8_lossy(slot.key()))
            )),
        }
    }

    fn finish(self) -> Result<()> {
        if self.pending_key.is_some() {
            return order_error("map ended with a key but no value");
        }
        self.out.raw(b"d");
        for (key, value) in self.entries.iter() {
            self.out.byte_string(key);
            self.out.raw(value);
        }
        let close: &[u8] = if self.close_variant { b"ee" } else { b"e" };
        self.out.raw(close);
        Ok(())
    }
}

impl<'a> ser::SerializeMap for Dict<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<()> {
        if self.pending_key.is_some() {
            return order_error("two keys in a row");
        }
        self.pending_key = Some(key.serialize(&mut StringSerializer)?);
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
        match self.pending_key.take() {
            Some(key) => self.insert(key, value),
            None => order_error("value without a key"),
        }
    }

    fn serialize_entry<K: ?Sized + Serialize, V: ?Sized + Serialize>(&mut self, key: &K, value: &V) -> Result<()> {
        if self.pending_key.is_some() {
            return order_error("entry while a key is pending");
        }
        let key = key.serialize(&mut StringSerializer)?;
        self.insert(key, value)
    }

    fn end(self) -> Result<()> { self.finish() }
}

impl<'a> ser::SerializeStruct for Dict<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, key: &'static str, value: &T) -> Result<()> {
        self.insert(key.as_bytes().to_vec(), value)
    }

    fn end(self) -> Result<()> { self.finish() }
}

impl<'a> ser::SerializeStructVariant for Dict<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, key: &'static str, value: &T) -> Result<()> {
        self.insert(key.as_bytes().to_vec(), value)
    }

    fn end(self) -> Result<()> { self.finish() }
}
