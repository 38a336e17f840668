//! PackStream, the binary value encoding carried in Bolt message bodies.
//!
//! Big-endian throughout. The proxy only ever decodes the handful of values
//! it inspects (HELLO metadata, BEGIN/RUN bodies, FAILURE maps) and encodes
//! small hand-crafted responses, so the surface here is deliberately narrow:
//! floats are recognized but rejected as unsupported.

pub mod decode;
pub mod encode;
pub mod marker;
pub mod value;

pub use decode::{parse_array, parse_int, parse_map, parse_string, parse_tiny_int};
pub use encode::{int_to_bytes, string_to_bytes, tiny_map_to_bytes};
pub use value::{Map, Value};
