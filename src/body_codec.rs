//! Decoding of request/response payloads for inspection.
//!
//! Only the logging copy is ever decoded. The bytes that go out on the wire
//! are the ones the peer sent, compression included.

use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use hyper::header::{CONTENT_ENCODING, HeaderMap};
use std::io::{self, Read};

/// Content encodings the codec knows how to unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Identity,
}

impl Encoding {
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip") => Encoding::Gzip,
            _ => Encoding::Identity,
        }
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self::from_header(headers.get(CONTENT_ENCODING).and_then(|v| v.to_str().ok()))
    }
}

/// Returns the readable form of `raw`.
///
/// Unknown or absent encodings hand back the same buffer (a refcount bump,
/// no copy).
pub fn decode(raw: &Bytes, encoding: Encoding) -> io::Result<Bytes> {
    match encoding {
        Encoding::Identity => Ok(raw.clone()),
        Encoding::Gzip => {
            let mut decoder = MultiGzDecoder::new(raw.as_ref());
            let mut out = Vec::with_capacity(raw.len() * 2);
            decoder.read_to_end(&mut out)?;
            Ok(Bytes::from(out))
        }
    }
}
