//! Wire-level types for the wavemeter query protocol: a JSON request framed
//! by a 2-byte big-endian length prefix, and the JSON reply it elicits. No
//! live socket client ships with this crate — `traits::WavemeterSource` is
//! the boundary a caller implements instead.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WavemeterRequest {
    pub action: String,
    pub value: String,
}

impl WavemeterRequest {
    pub fn query_frequency() -> Self {
        Self {
            action: "query".to_string(),
            value: "frequency".to_string(),
        }
    }
}

/// `{timestamp_s, frequency_thz}` per laser key.
pub type LaserReading = (f64, f64);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WavemeterResponse {
    pub result: (f64, HashMap<String, LaserReading>),
}

impl WavemeterResponse {
    pub fn reading_for(&self, laser_key: &str) -> Option<LaserReading> {
        self.result.1.get(laser_key).copied()
    }
}

/// Writes `request` as length-prefixed JSON: a 2-byte big-endian length
/// followed by that many bytes of UTF-8 JSON.
pub fn write_framed_request<W: Write>(w: &mut W, request: &WavemeterRequest) -> io::Result<()> {
    let body = serde_json::to_vec(request)?;
    let len: u16 = body
        .len()
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "request body too large"))?;
    w.write_u16::<BigEndian>(len)?;
    w.write_all(&body)
}

/// Reads one length-prefixed JSON response frame.
pub fn read_framed_response<R: Read>(r: &mut R) -> io::Result<WavemeterResponse> {
    let len = r.read_u16::<BigEndian>()?;
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body)?;
    serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_serializes_with_expected_shape() {
        let req = WavemeterRequest::query_frequency();
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"action":"query","value":"frequency"}"#);
    }

    #[test]
    fn framed_roundtrip_recovers_response() {
        let mut readings = HashMap::new();
        readings.insert("ch1".to_string(), (1700000000.0, 399.7));
        let response = WavemeterResponse {
            result: (1700000000.123, readings),
        };

        let mut buf = Vec::new();
        let body = serde_json::to_vec(&response).unwrap();
        buf.write_u16::<BigEndian>(body.len() as u16).unwrap();
        buf.write_all(&body).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded = read_framed_response(&mut cursor).unwrap();
        assert_eq!(decoded, response);
        assert_eq!(decoded.reading_for("ch1"), Some((1700000000.0, 399.7)));
        assert_eq!(decoded.reading_for("missing"), None);
    }

    #[test]
    fn write_framed_request_round_trips_through_read() {
        let req = WavemeterRequest::query_frequency();
        let mut buf = Vec::new();
        write_framed_request(&mut buf, &req).unwrap();

        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        let decoded: WavemeterRequest = serde_json::from_slice(&buf[2..2 + len]).unwrap();
        assert_eq!(decoded, req);
    }
}
