//! TDX quote protocol framing and payload codecs.
//!
//! Every response starts with a 16-byte header: three `u32` words we ignore,
//! then the compressed and uncompressed body sizes as `u16`. When the sizes
//! differ the body is zlib-compressed. A short header means the byte stream
//! has lost alignment with message boundaries.

use flate2::read::ZlibDecoder;
use std::io::{self, Read};
use thiserror::Error;

/// Response header: 12 opaque bytes, then compressed and plain body sizes.
pub const HEADER_LEN: usize = 16;

/// Daily kline category in `get_security_bars`.
pub const CATEGORY_DAILY: u16 = 9;

/// Server-side cap on bars per request.
pub const MAX_BARS_PER_REQUEST: u16 = 800;

/// Entries per `get_security_list` page.
pub const SECURITY_PAGE_SIZE: usize = 1000;

const SECURITY_ENTRY_LEN: usize = 29;

/// Handshake packets sent once after connecting.
pub const SETUP_PACKETS: [&[u8]; 3] = [
    &[0x0c, 0x02, 0x18, 0x93, 0x00, 0x01, 0x03, 0x00, 0x03, 0x00, 0x0d, 0x00, 0x01],
    &[0x0c, 0x02, 0x18, 0x94, 0x00, 0x01, 0x03, 0x00, 0x03, 0x00, 0x0d, 0x00, 0x02],
    &[
        0x0c, 0x03, 0x18, 0x99, 0x00, 0x01, 0x20, 0x00, 0x20, 0x00, 0xdb, 0x0f, 0xd5, 0xd0, 0xc9,
        0xcc, 0xd6, 0xa4, 0xa8, 0xaf, 0x00, 0x00, 0x00, 0x8f, 0xc2, 0x25, 0x40, 0x13, 0x00, 0x00,
        0xd5, 0x00, 0xc9, 0xcc, 0xbd, 0xf0, 0xd7, 0xea, 0x00, 0x00, 0x00, 0x02,
    ],
];

const SECURITY_LIST_PREFIX: [u8; 12] = [
    0x0c, 0x01, 0x18, 0x64, 0x01, 0x01, 0x06, 0x00, 0x06, 0x00, 0x50, 0x04,
];

#[derive(Debug, Error)]
pub enum CodecError {
    /// The stream no longer lines up with frame boundaries.
    #[error("frame desync: {0}")]
    Desync(String),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Read one response frame and return its (decompressed) body.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, CodecError> {
    let mut header = [0u8; HEADER_LEN];
    let got = read_full(reader, &mut header)?;
    if got != HEADER_LEN {
        return Err(CodecError::Desync(format!(
            "header is {got} bytes, expected {HEADER_LEN}"
        )));
    }
    let zip_size = u16::from_le_bytes([header[12], header[13]]) as usize;
    let unzip_size = u16::from_le_bytes([header[14], header[15]]) as usize;
    if zip_size > unzip_size {
        return Err(CodecError::Desync(format!(
            "compressed size {zip_size} exceeds body size {unzip_size}"
        )));
    }

    let mut body = vec![0u8; zip_size];
    let got = read_full(reader, &mut body)?;
    if got != zip_size {
        return Err(CodecError::Desync(format!(
            "body is {got} bytes, header promised {zip_size}"
        )));
    }
    if zip_size == unzip_size {
        return Ok(body);
    }

    let mut out = Vec::with_capacity(unzip_size);
    ZlibDecoder::new(body.as_slice())
        .take(unzip_size as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Desync(format!("zlib body: {e}")))?;
    if out.len() != unzip_size {
        return Err(CodecError::Desync(format!(
            "inflated {} bytes, header promised {unzip_size}",
            out.len()
        )));
    }
    Ok(out)
}

/// Like `read_exact`, but reports how many bytes arrived before EOF.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, CodecError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CodecError::Io(e)),
        }
    }
    Ok(filled)
}

fn code_bytes(code: &str) -> Result<[u8; 6], CodecError> {
    let raw = code.as_bytes();
    if raw.len() != 6 || !raw.iter().all(u8::is_ascii_digit) {
        return Err(CodecError::Malformed(format!("code '{code}' is not 6 digits")));
    }
    let mut out = [0u8; 6];
    out.copy_from_slice(raw);
    Ok(out)
}

/// `get_security_bars` request for daily bars, newest-first offset `start`.
pub fn encode_bars_request(
    market: u16,
    code: &str,
    start: u16,
    count: u16,
) -> Result<Vec<u8>, CodecError> {
    let code = code_bytes(code)?;
    let mut pkt = Vec::with_capacity(38);
    pkt.extend_from_slice(&0x010c_u16.to_le_bytes());
    pkt.extend_from_slice(&0x0101_6408_u32.to_le_bytes());
    pkt.extend_from_slice(&0x1c_u16.to_le_bytes());
    pkt.extend_from_slice(&0x1c_u16.to_le_bytes());
    pkt.extend_from_slice(&0x052d_u16.to_le_bytes());
    pkt.extend_from_slice(&market.to_le_bytes());
    pkt.extend_from_slice(&code);
    pkt.extend_from_slice(&CATEGORY_DAILY.to_le_bytes());
    pkt.extend_from_slice(&1u16.to_le_bytes());
    pkt.extend_from_slice(&start.to_le_bytes());
    pkt.extend_from_slice(&count.min(MAX_BARS_PER_REQUEST).to_le_bytes());
    pkt.extend_from_slice(&0u32.to_le_bytes());
    pkt.extend_from_slice(&0u32.to_le_bytes());
    pkt.extend_from_slice(&0u16.to_le_bytes());
    Ok(pkt)
}

/// `get_security_list` request for one page starting at `start`.
pub fn encode_security_list_request(market: u16, start: u16) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(16);
    pkt.extend_from_slice(&SECURITY_LIST_PREFIX);
    pkt.extend_from_slice(&market.to_le_bytes());
    pkt.extend_from_slice(&start.to_le_bytes());
    pkt
}

/// One daily bar as carried on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct TdxBar {
    /// `YYYYMMDD`
    pub date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TdxSecurity {
    pub code: String,
    pub name: String,
    pub pre_close: f64,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos + n;
        let slice = self.buf.get(self.pos..end).ok_or_else(|| {
            CodecError::Malformed(format!("need {n} bytes at offset {}", self.pos))
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Signed variable-length integer: the first byte carries 6 value bits,
    /// a sign bit (0x40) and a continuation bit (0x80); following bytes carry
    /// 7 value bits each.
    fn price(&mut self) -> Result<i64, CodecError> {
        let first = self.u8()?;
        let negative = first & 0x40 != 0;
        let mut value = i64::from(first & 0x3f);
        let mut shift = 6;
        let mut byte = first;
        while byte & 0x80 != 0 {
            byte = self.u8()?;
            if shift > 56 {
                return Err(CodecError::Malformed("price varint overflow".into()));
            }
            value += i64::from(byte & 0x7f) << shift;
            shift += 7;
        }
        Ok(if negative { -value } else { value })
    }
}

/// Decode a signed variable-length price delta from the start of `buf`.
pub fn decode_price(buf: &[u8]) -> Result<(i64, usize), CodecError> {
    let mut cur = Cursor::new(buf);
    let v = cur.price()?;
    Ok((v, cur.pos))
}

/// Decode TDX's packed floating point volume/amount word.
pub fn decode_volume(raw: u32) -> f64 {
    let logpoint = (raw >> 24) as i32;
    let hleax = (raw >> 16) & 0xff;
    let lheax = f64::from((raw >> 8) & 0xff);
    let lleax = f64::from(raw & 0xff);

    let ecx = logpoint * 2 - 0x7f;
    let edx = logpoint * 2 - 0x86;
    let esi = logpoint * 2 - 0x8e;
    let eax = logpoint * 2 - 0x96;

    let mut base = 2f64.powi(ecx.abs());
    if ecx < 0 {
        base = 1.0 / base;
    }

    let high = if hleax > 0x80 {
        2f64.powi(edx) * 128.0 + f64::from(hleax & 0x7f) * 2f64.powi(edx + 1)
    } else if edx >= 0 {
        2f64.powi(edx) * f64::from(hleax)
    } else {
        (1.0 / 2f64.powi(edx)) * f64::from(hleax)
    };

    let mut mid = 2f64.powi(esi) * lheax;
    let mut low = 2f64.powi(eax) * lleax;
    if hleax & 0x80 != 0 {
        mid *= 2.0;
        low *= 2.0;
    }
    base + high + mid + low
}

/// Parse a `get_security_bars` response body.
///
/// Prices are deltas in thousandths: open is relative to the previous bar's
/// close, the other three relative to this bar's open.
pub fn parse_bars(body: &[u8]) -> Result<Vec<TdxBar>, CodecError> {
    let mut cur = Cursor::new(body);
    let count = cur.u16()? as usize;
    let mut bars = Vec::with_capacity(count);
    let mut prev_close = 0i64;

    for _ in 0..count {
        let zipday = cur.u32()?;
        let open_diff = cur.price()?;
        let close_diff = cur.price()?;
        let high_diff = cur.price()?;
        let low_diff = cur.price()?;
        let volume = decode_volume(cur.u32()?);
        let amount = decode_volume(cur.u32()?);

        let offset = |base: i64, diff: i64| {
            base.checked_add(diff)
                .ok_or_else(|| CodecError::Malformed(format!("price delta {diff} overflows bar {zipday}")))
        };
        let open = offset(prev_close, open_diff)?;
        let close = offset(open, close_diff)?;
        let high = offset(open, high_diff)?;
        let low = offset(open, low_diff)?;
        prev_close = close;

        bars.push(TdxBar {
            date: format!("{zipday:08}"),
            open: open as f64 / 1000.0,
            close: close as f64 / 1000.0,
            high: high as f64 / 1000.0,
            low: low as f64 / 1000.0,
            volume,
            amount,
        });
    }
    Ok(bars)
}

/// Parse a `get_security_list` response body. Names are GBK on the wire.
pub fn parse_security_list(body: &[u8]) -> Result<Vec<TdxSecurity>, CodecError> {
    let mut cur = Cursor::new(body);
    let count = cur.u16()? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let entry = cur.take(SECURITY_ENTRY_LEN)?;
        let code = String::from_utf8_lossy(&entry[0..6]).trim_end_matches('\0').to_string();
        let name_raw = &entry[8..16];
        let name_end = name_raw.iter().position(|&b| b == 0).unwrap_or(name_raw.len());
        let (name, _, _) = encoding_rs::GBK.decode(&name_raw[..name_end]);
        let pre_close_raw = u32::from_le_bytes([entry[21], entry[22], entry[23], entry[24]]);
        out.push(TdxSecurity {
            code,
            name: name.trim().to_string(),
            pre_close: decode_volume(pre_close_raw),
        });
    }
    Ok(out)
}

/// Encoders for the server side of the protocol, used by loopback tests.
#[doc(hidden)]
pub mod wire {
    use super::HEADER_LEN;

    /// Inverse of the price varint decoder.
    pub fn encode_price(value: i64) -> Vec<u8> {
        let negative = value < 0;
        let mut rest = value.unsigned_abs();
        let mut first = (rest & 0x3f) as u8;
        if negative {
            first |= 0x40;
        }
        rest >>= 6;
        let mut out = vec![first];
        while rest > 0 {
            let last = out.len() - 1;
            out[last] |= 0x80;
            out.push((rest & 0x7f) as u8);
            rest >>= 7;
        }
        out
    }

    /// Uncompressed response frame around `body`.
    pub fn frame(body: &[u8]) -> Vec<u8> {
        let len = body.len() as u16;
        let mut out = vec![0u8; HEADER_LEN - 4];
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(body);
        out
    }

    /// `get_security_bars` body for `(yyyymmdd, open, high, low, close)` in
    /// thousandths, with zero volume and amount words.
    pub fn bars_body(bars: &[(u32, i64, i64, i64, i64)]) -> Vec<u8> {
        let mut out = (bars.len() as u16).to_le_bytes().to_vec();
        let mut prev_close = 0i64;
        for &(day, open, high, low, close) in bars {
            out.extend_from_slice(&day.to_le_bytes());
            out.extend(encode_price(open - prev_close));
            out.extend(encode_price(close - open));
            out.extend(encode_price(high - open));
            out.extend(encode_price(low - open));
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            prev_close = close;
        }
        out
    }

    /// `get_security_list` body for ASCII `(code, name)` entries.
    pub fn security_list_body(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut out = (entries.len() as u16).to_le_bytes().to_vec();
        for (code, name) in entries {
            let mut entry = [0u8; 29];
            entry[..6].copy_from_slice(&code.as_bytes()[..6]);
            let name = name.as_bytes();
            let n = name.len().min(8);
            entry[8..8 + n].copy_from_slice(&name[..n]);
            out.extend_from_slice(&entry);
        }
        out
    }
}
