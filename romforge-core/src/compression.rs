use std::sync::Arc;

use crate::{RomError, Result};

pub const TYPE_NONE: u32 = 0;
pub const TYPE_LZSS: u32 = 1;
pub const TYPE_RLE: u32 = 5;

/// Codec used for virtual file payloads.
pub trait CompressionCodec {
    fn compress(&self, compression_type: u32, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, compression_type: u32, data: &[u8], expected_len: usize)
        -> Result<Vec<u8>>;

    /// Number of bytes of `data` consumed while producing `expected_len`
    /// decompressed bytes.
    fn compressed_size_of(
        &self,
        compression_type: u32,
        data: &[u8],
        expected_len: usize,
    ) -> Result<usize>;

    fn supports(&self, compression_type: u32) -> bool;
}

pub type SharedCodec = Arc<dyn CompressionCodec + Send + Sync>;

/// Handles the uncompressed, LZSS and RLE payload types.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinCodec;

impl BuiltinCodec {
    pub fn shared() -> SharedCodec {
        Arc::new(BuiltinCodec)
    }
}

fn unsupported(compression_type: u32) -> RomError {
    RomError::Compression {
        compression_type,
        message: "no codec registered for this type".to_string(),
    }
}

impl CompressionCodec for BuiltinCodec {
    fn compress(&self, compression_type: u32, data: &[u8]) -> Result<Vec<u8>> {
        match compression_type {
            TYPE_NONE => Ok(data.to_vec()),
            TYPE_LZSS => Ok(lzss_compress(data)),
            TYPE_RLE => Ok(rle_compress(data)),
            other => Err(unsupported(other)),
        }
    }

    fn decompress(
        &self,
        compression_type: u32,
        data: &[u8],
        expected_len: usize,
    ) -> Result<Vec<u8>> {
        let (out, _) = match compression_type {
            TYPE_NONE => {
                let bytes = data.get(..expected_len).ok_or(RomError::Compression {
                    compression_type,
                    message: format!("payload shorter than {expected_len} bytes"),
                })?;
                (bytes.to_vec(), expected_len)
            }
            TYPE_LZSS => lzss_decompress(data, expected_len)?,
            TYPE_RLE => rle_decompress(data, expected_len)?,
            other => return Err(unsupported(other)),
        };
        Ok(out)
    }

    fn compressed_size_of(
        &self,
        compression_type: u32,
        data: &[u8],
        expected_len: usize,
    ) -> Result<usize> {
        match compression_type {
            TYPE_NONE => Ok(expected_len),
            TYPE_LZSS => Ok(lzss_decompress(data, expected_len)?.1),
            TYPE_RLE => Ok(rle_decompress(data, expected_len)?.1),
            other => Err(unsupported(other)),
        }
    }

    fn supports(&self, compression_type: u32) -> bool {
        matches!(compression_type, TYPE_NONE | TYPE_LZSS | TYPE_RLE)
    }
}

// LZSS with a 1 KiB ring buffer. Flag bytes are consumed LSB first, a set
// bit is a literal. Back-references are two bytes: the low 8 bits of the
// ring position, then 2 high position bits and a 6-bit length minus 3.
const WINDOW: usize = 1024;
const WINDOW_MASK: usize = WINDOW - 1;
const WINDOW_START: usize = 0x3BE;
const MIN_MATCH: usize = 3;
const MAX_MATCH: usize = 0x3F + MIN_MATCH;

fn truncated_stream(compression_type: u32, produced: usize, expected: usize) -> RomError {
    RomError::Compression {
        compression_type,
        message: format!("stream ended after {produced} of {expected} bytes"),
    }
}

/// Returns the decompressed bytes and how much input was consumed.
pub fn lzss_decompress(data: &[u8], expected_len: usize) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::with_capacity(expected_len);
    let mut window = [0u8; WINDOW];
    let mut cur = WINDOW_START;
    let mut pos = 0usize;

    while out.len() < expected_len {
        let flags = *data
            .get(pos)
            .ok_or_else(|| truncated_stream(TYPE_LZSS, out.len(), expected_len))?;
        pos += 1;

        for bit in 0..8 {
            if out.len() >= expected_len {
                break;
            }

            if flags & (1 << bit) != 0 {
                let c = *data
                    .get(pos)
                    .ok_or_else(|| truncated_stream(TYPE_LZSS, out.len(), expected_len))?;
                pos += 1;
                out.push(c);
                window[cur] = c;
                cur = (cur + 1) & WINDOW_MASK;
            } else {
                let (b1, b2) = match (data.get(pos), data.get(pos + 1)) {
                    (Some(&b1), Some(&b2)) => (b1, b2),
                    _ => return Err(truncated_stream(TYPE_LZSS, out.len(), expected_len)),
                };
                pos += 2;

                let src = (b1 as usize) | (((b2 as usize) & 0xC0) << 2);
                let count = ((b2 & 0x3F) as usize) + MIN_MATCH;
                for k in 0..count {
                    if out.len() >= expected_len {
                        break;
                    }
                    let c = window[(src + k) & WINDOW_MASK];
                    out.push(c);
                    window[cur] = c;
                    cur = (cur + 1) & WINDOW_MASK;
                }
            }
        }
    }

    Ok((out, pos))
}

/// Greedy encoder producing streams `lzss_decompress` accepts.
///
/// History before the first byte reads as zero, matching the zero-filled
/// ring buffer of the decoder.
pub fn lzss_compress(input: &[u8]) -> Vec<u8> {
    let hist = |j: isize| -> u8 {
        if j < 0 {
            0
        } else {
            input[j as usize]
        }
    };

    let mut out = Vec::with_capacity(input.len() / 2 + 16);
    let mut code_buf = [0u8; 17];
    let mut code_ptr = 1usize;
    let mut bit = 0u8;
    let mut p = 0usize;

    while p < input.len() {
        let max_len = MAX_MATCH.min(input.len() - p);
        let mut best_len = 0usize;
        let mut best_dist = 0usize;

        if max_len >= MIN_MATCH {
            for dist in 1..=WINDOW {
                let base = p as isize - dist as isize;
                let mut len = 0usize;
                // Overlapping copies read bytes the same match produced, which
                // are input bytes themselves.
                while len < max_len && hist(base + len as isize) == input[p + len] {
                    len += 1;
                }
                if len > best_len {
                    best_len = len;
                    best_dist = dist;
                    if len == max_len {
                        break;
                    }
                }
            }
        }

        if best_len >= MIN_MATCH {
            let src = (WINDOW_START + p + WINDOW - best_dist) & WINDOW_MASK;
            code_buf[code_ptr] = (src & 0xFF) as u8;
            code_buf[code_ptr + 1] = (((src >> 2) & 0xC0) | (best_len - MIN_MATCH)) as u8;
            code_ptr += 2;
            p += best_len;
        } else {
            code_buf[0] |= 1 << bit;
            code_buf[code_ptr] = input[p];
            code_ptr += 1;
            p += 1;
        }

        bit += 1;
        if bit == 8 {
            out.extend_from_slice(&code_buf[..code_ptr]);
            code_buf[0] = 0;
            code_ptr = 1;
            bit = 0;
        }
    }

    if code_ptr > 1 {
        out.extend_from_slice(&code_buf[..code_ptr]);
    }

    out
}

/// RLE: a code byte with the top bit set copies `code & 0x7F` literals,
/// otherwise the next byte is repeated `code` times.
pub fn rle_decompress(data: &[u8], expected_len: usize) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::with_capacity(expected_len);
    let mut pos = 0usize;

    while out.len() < expected_len {
        let code = *data
            .get(pos)
            .ok_or_else(|| truncated_stream(TYPE_RLE, out.len(), expected_len))?;
        pos += 1;

        if code & 0x80 != 0 {
            let count = (code & 0x7F) as usize;
            let run = data
                .get(pos..pos + count)
                .ok_or_else(|| truncated_stream(TYPE_RLE, out.len(), expected_len))?;
            out.extend_from_slice(run);
            pos += count;
        } else {
            let value = *data
                .get(pos)
                .ok_or_else(|| truncated_stream(TYPE_RLE, out.len(), expected_len))?;
            pos += 1;
            out.extend(std::iter::repeat(value).take(code as usize));
        }
    }

    out.truncate(expected_len);
    Ok((out, pos))
}

pub fn rle_compress(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 64 + 2);
    let mut literals: Vec<u8> = Vec::new();

    let flush = |literals: &mut Vec<u8>, out: &mut Vec<u8>| {
        for chunk in literals.chunks(0x7F) {
            out.push(0x80 | chunk.len() as u8);
            out.extend_from_slice(chunk);
        }
        literals.clear();
    };

    let mut i = 0usize;
    while i < input.len() {
        let value = input[i];
        let mut run = 1usize;
        while i + run < input.len() && input[i + run] == value && run < 0x7F {
            run += 1;
        }

        if run >= 3 {
            flush(&mut literals, &mut out);
            out.push(run as u8);
            out.push(value);
        } else {
            literals.extend(std::iter::repeat(value).take(run));
        }
        i += run;
    }
    flush(&mut literals, &mut out);

    out
}
