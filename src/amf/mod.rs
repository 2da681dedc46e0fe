//! AMF0 (Action Message Format) support
//!
//! RTMP command and data messages are sequences of AMF0 values. AMF3 object
//! encoding is not supported; AMF3 command envelopes are unwrapped by the
//! message layer and decoded as AMF0.

pub mod amf0;
pub mod value;

pub use amf0::{decode_all, encode_all, encode_value, Amf0Decoder};
pub use value::{AmfObject, AmfValue};
