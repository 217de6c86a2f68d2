use serde::de::{self, Deserializer};
use serde::forward_to_deserialize_any;

use super::error::{Error, Result};
use super::value::Parser;

pub struct Decoder<'de> {
    parser: Parser<'de>,
}

impl<'de> Decoder<'de> {
    pub fn new(input: &'de [u8]) -> Self {
        Self { parser: Parser::new(input) }
    }
}

struct Access<'a, 'de: 'a> {
    d: &'a mut Decoder<'de>,
}

impl<'de, 'a> Deserializer<'de> for &'a mut Decoder<'de> {

    type Error = Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        match self.parser.peek()? {
            b'i' => visitor.visit_i64(self.parser.parse_int()?),
            b'0'..=b'9' => visitor.visit_borrowed_bytes(self.parser.parse_bytes()?),
            b'l' => {
                self.parser.enter()?;
                self.parser.next()?;
                let value = visitor.visit_seq(Access { d: &mut *self });
                self.parser.leave();
                value
            },
            b'd' => {
                self.parser.enter()?;
                self.parser.next()?;
                let value = visitor.visit_map(Access { d: &mut *self });
                self.parser.leave();
                value
            },
            found => Err(Error::InvalidToken {
                pos: self.parser.pos,
                expected: "a valid token type",
                found: found as char,
            }),
        }
    }

    forward_to_deserialize_any! {
        bool char
        i8 i16 i32 i64 i128
        u8 u16 u32 u64 u128
        f32 f64
        unit bytes byte_buf
        seq map unit_struct tuple tuple_struct
        ignored_any struct enum
    }

    fn deserialize_str<V>(self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        let pos = self.parser.pos;
        let bytes = self.parser.parse_bytes()?;
        let s = std::str::from_utf8(bytes)
            .map_err(|_| Error::InvalidType(format!("non utf-8 string at byte {}", pos)))?;
        visitor.visit_borrowed_str(s)
    }

    fn deserialize_string<V>(self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_identifier<V>(self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        self.deserialize_str(visitor)
    }

    // A present key is always Some, missing keys are handled by serde defaults.
    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        visitor.visit_some(self)
    }

    fn deserialize_newtype_struct<V>(self, _name: &'static str, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        visitor.visit_newtype_struct(self)
    }
}

impl<'de, 'a> de::SeqAccess<'de> for Access<'a, 'de> {
    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>>
        where T: de::DeserializeSeed<'de>
    {
        if self.d.parser.peek()? == b'e' {
            self.d.parser.next()?;
            return Ok(None);
        }
        seed.deserialize(&mut *self.d).map(Some)
    }
}

impl<'de, 'a> de::MapAccess<'de> for Access<'a, 'de> {
    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>>
        where K: de::DeserializeSeed<'de>
    {
        match self.d.parser.peek()? {
            b'e' => {
                self.d.parser.next()?;
                Ok(None)
            },
            b'0'..=b'9' => seed.deserialize(&mut *self.d).map(Some),
            found => Err(Error::InvalidToken {
                pos: self.d.parser.pos,
                expected: "byte string key",
                found: found as char,
            }),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value>
        where V: de::DeserializeSeed<'de>
    {
        seed.deserialize(&mut *self.d)
    }
}

pub fn decode_bytes<'de, T>(b: &'de [u8]) -> Result<T>
    where T: de::Deserialize<'de>
{
    let mut decoder = Decoder::new(b);
    let out = T::deserialize(&mut decoder)?;
    decoder.parser.finish()?;
    Ok(out)
}

pub fn decode_str<'de, T>(s: &'de str) -> Result<T>
    where T: de::Deserialize<'de>
{
    decode_bytes(s.as_bytes())
}
