// Bencode support for the engine.
// `Value` is an owned tree for ad-hoc inspection and encoding, the serde
// `Decoder` deserializes typed structs straight from borrowed input.
mod de;
mod error;
mod value;

// For bencode -> T
pub use de::{decode_bytes, decode_str, Decoder};

// For bencode <-> tree
pub use value::{dict_value_span, Value};

pub use error::{Error, Result};
