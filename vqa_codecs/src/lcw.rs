//! LCW, the byte-oriented LZ77 scheme used for codebooks and depth buffers.
//!
//! Command bytes:
//!
//! ```text
//! 0x80                      end of stream
//! 10nnnnnn                  copy n literal bytes (1..=63)
//! 0cccpppp pppppppp         copy ccc+3 bytes from p bytes back
//! 11nnnnnn pos:u16          copy n+3 bytes (3..=64) from pos
//! 0xFE count:u16 value:u8   fill count bytes with value
//! 0xFF count:u16 pos:u16    copy count bytes from pos
//! ```
//!
//! `pos` is an absolute output offset, unless the stream starts with a 0x00
//! byte, in which case it is a distance back from the write cursor like the
//! short form's `p`.

use vqa_core::{Error, Result};

const END: u8 = 0x80;
const FILL: u8 = 0xFE;
const LONG_COPY: u8 = 0xFF;
const MEDIUM_COPY: u8 = 0xC0;
const LITERAL: u8 = 0x80;

const MAX_LITERAL: usize = 0x3F;
const MAX_SHORT_LEN: usize = 10;
const MAX_SHORT_DIST: usize = 0xFFF;
const MAX_MEDIUM_LEN: usize = 64;
const MAX_LONG: usize = 0xFFFF;

/// Decompress `input` into `output`, which must end up exactly full.
///
/// Producing fewer bytes than `output.len()`, writing past it, referencing
/// output that has not been produced yet, or a command cut short by the end
/// of `input` are all decode errors. Nothing is clamped.
pub fn decompress(input: &[u8], output: &mut [u8]) -> Result<()> {
    let mut src = Source { buf: input, pos: 0 };
    let relative = input.first() == Some(&0);
    if relative {
        src.pos = 1;
    }

    let out_len = output.len();
    let mut dst = 0usize;

    while let Some(cmd) = src.next_opt() {
        if cmd == END {
            break;
        }
        if dst == out_len {
            return Err(Error::decode(format!(
                "LCW overrun: command 0x{:02x} after {} output bytes",
                cmd, out_len
            )));
        }

        match cmd {
            LONG_COPY => {
                let count = src.u16()? as usize;
                let pos = src.u16()? as usize;
                check_room(dst, count, out_len)?;
                let from = copy_source(dst, pos, relative)?;
                copy_back(output, from, dst, count);
                dst += count;
            }
            FILL => {
                let count = src.u16()? as usize;
                let value = src.u8()?;
                check_room(dst, count, out_len)?;
                output[dst..dst + count].fill(value);
                dst += count;
            }
            c if c >= MEDIUM_COPY => {
                let count = (c & 0x3F) as usize + 3;
                let pos = src.u16()? as usize;
                check_room(dst, count, out_len)?;
                let from = copy_source(dst, pos, relative)?;
                copy_back(output, from, dst, count);
                dst += count;
            }
            c if c >= LITERAL => {
                let count = (c & 0x3F) as usize;
                check_room(dst, count, out_len)?;
                let bytes = src.take(count)?;
                output[dst..dst + count].copy_from_slice(bytes);
                dst += count;
            }
            c => {
                let count = ((c & 0x70) >> 4) as usize + 3;
                let dist = (((c & 0x0F) as usize) << 8) | src.u8()? as usize;
                check_room(dst, count, out_len)?;
                let from = copy_source(dst, dist, true)?;
                copy_back(output, from, dst, count);
                dst += count;
            }
        }
    }

    if dst != out_len {
        return Err(Error::decode(format!(
            "LCW underrun: produced {} of {} bytes",
            dst, out_len
        )));
    }
    Ok(())
}

/// Upper bound on what `input_len` bytes of LCW can expand to.
///
/// The densest command is a fill: four bytes for up to 65535 output bytes.
pub fn max_output_len(input_len: usize) -> usize {
    input_len.saturating_mul(MAX_LONG.div_ceil(4))
}

struct Source<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Source<'a> {
    fn next_opt(&mut self) -> Option<u8> {
        let b = self.buf.get(self.pos).copied();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }

    fn u8(&mut self) -> Result<u8> {
        self.next_opt()
            .ok_or_else(|| Error::decode("LCW stream ends inside a command"))
    }

    fn u16(&mut self) -> Result<u16> {
        let lo = self.u8()?;
        let hi = self.u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or_else(|| Error::decode("LCW literal run past end of input"))?;
        self.pos += n;
        Ok(bytes)
    }
}

#[inline]
fn check_room(dst: usize, count: usize, out_len: usize) -> Result<()> {
    if dst + count > out_len {
        return Err(Error::decode(format!(
            "LCW overrun: {} bytes at offset {} exceed {} byte output",
            count, dst, out_len
        )));
    }
    Ok(())
}

/// Resolve a copy source to an absolute offset that precedes `dst`.
#[inline]
fn copy_source(dst: usize, pos: usize, relative: bool) -> Result<usize> {
    let from = if relative {
        if pos == 0 || pos > dst {
            return Err(Error::decode(format!(
                "LCW back-reference {} bytes behind offset {}",
                pos, dst
            )));
        }
        dst - pos
    } else {
        pos
    };
    if from >= dst {
        return Err(Error::decode(format!(
            "LCW copy from offset {} not yet produced (at {})",
            from, dst
        )));
    }
    Ok(from)
}

/// Byte-wise so that overlapping copies repeat a pattern.
#[inline]
fn copy_back(output: &mut [u8], from: usize, dst: usize, count: usize) {
    for i in 0..count {
        output[dst + i] = output[from + i];
    }
}

// ── Compression ────────────────────────────────────────────────────────────

const HASH_BITS: u32 = 14;
const MAX_CHAIN: usize = 64;
const MIN_FILL: usize = 5;

/// Compress `input` into a relative-mode LCW stream.
///
/// Uses fills for byte runs, short/medium/long back-references for repeats
/// and literal runs otherwise, and terminates with the end marker.
pub fn compress(input: &[u8]) -> Vec<u8> {
    let n = input.len();
    let mut out = Vec::with_capacity(n / 2 + 16);
    out.push(0);

    let mut head = vec![usize::MAX; 1 << HASH_BITS];
    let mut prev = vec![usize::MAX; n];
    let mut literal_start = 0usize;
    let mut i = 0usize;

    let insert = |pos: usize, head: &mut [usize], prev: &mut [usize]| {
        if pos + 3 <= n {
            let h = hash3(&input[pos..pos + 3]);
            prev[pos] = head[h];
            head[h] = pos;
        }
    };

    while i < n {
        let run = input[i..]
            .iter()
            .take(MAX_LONG)
            .take_while(|&&b| b == input[i])
            .count();
        if run >= MIN_FILL {
            flush_literals(&mut out, &input[literal_start..i]);
            out.push(FILL);
            out.extend_from_slice(&(run as u16).to_le_bytes());
            out.push(input[i]);
            for p in i..i + run {
                insert(p, &mut head, &mut prev);
            }
            i += run;
            literal_start = i;
            continue;
        }

        let (len, dist) = longest_match(input, i, &head, &prev);
        let short = dist <= MAX_SHORT_DIST && len <= MAX_SHORT_LEN;
        if len >= 3 && (short || len >= 4) {
            flush_literals(&mut out, &input[literal_start..i]);
            if short {
                out.push(((len - 3) << 4) as u8 | (dist >> 8) as u8);
                out.push(dist as u8);
            } else if len <= MAX_MEDIUM_LEN {
                out.push(MEDIUM_COPY | (len - 3) as u8);
                out.extend_from_slice(&(dist as u16).to_le_bytes());
            } else {
                out.push(LONG_COPY);
                out.extend_from_slice(&(len as u16).to_le_bytes());
                out.extend_from_slice(&(dist as u16).to_le_bytes());
            }
            for p in i..i + len {
                insert(p, &mut head, &mut prev);
            }
            i += len;
            literal_start = i;
        } else {
            insert(i, &mut head, &mut prev);
            i += 1;
        }
    }

    flush_literals(&mut out, &input[literal_start..]);
    out.push(END);
    out
}

#[inline]
fn hash3(b: &[u8]) -> usize {
    let v = (b[0] as u32) << 16 | (b[1] as u32) << 8 | b[2] as u32;
    (v.wrapping_mul(2_654_435_761) >> (32 - HASH_BITS)) as usize
}

/// Longest earlier match for `input[i..]` as `(length, distance)`.
fn longest_match(input: &[u8], i: usize, head: &[usize], prev: &[usize]) -> (usize, usize) {
    if i + 3 > input.len() {
        return (0, 0);
    }
    let max_len = (input.len() - i).min(MAX_LONG);
    let mut best = (0, 0);
    let mut cand = head[hash3(&input[i..i + 3])];
    let mut steps = 0;
    while cand != usize::MAX && steps < MAX_CHAIN {
        let dist = i - cand;
        if dist > MAX_LONG {
            break;
        }
        let len = (0..max_len)
            .take_while(|&k| input[cand + k] == input[i + k])
            .count();
        if len > best.0 {
            best = (len, dist);
            if len == max_len {
                break;
            }
        }
        cand = prev[cand];
        steps += 1;
    }
    best
}

fn flush_literals(out: &mut Vec<u8>, mut lits: &[u8]) {
    while !lits.is_empty() {
        let n = lits.len().min(MAX_LITERAL);
        out.push(LITERAL | n as u8);
        out.extend_from_slice(&lits[..n]);
        lits = &lits[n..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lcg_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = seed;
        (0..len)
            .map(|_| {
                rng = rng
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (rng >> 56) as u8
            })
            .collect()
    }

    fn round_trip(data: &[u8]) {
        let packed = compress(data);
        let mut out = vec![0u8; data.len()];
        decompress(&packed, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_absolute_mode_commands() {
        // literal "ab", medium copy of 4 from pos 0, fill 3 x 'z', long copy 2 from pos 1, end
        let stream = [
            0x82, b'a', b'b', 0xC1, 0, 0, 0xFE, 3, 0, b'z', 0xFF, 2, 0, 1, 0, 0x80,
        ];
        let mut out = [0u8; 11];
        decompress(&stream, &mut out).unwrap();
        assert_eq!(&out, b"abababzzzba");
    }

    #[test]
    fn test_short_copy_overlaps() {
        // literal 'x', short copy of 5 from 1 back -> 6 x 'x'
        let stream = [0x81, b'x', 0x20, 0x01, 0x80];
        let mut out = [0u8; 6];
        decompress(&stream, &mut out).unwrap();
        assert_eq!(&out, b"xxxxxx");
    }

    #[test]
    fn test_relative_mode_medium_copy() {
        // relative flag, literal "abc", medium copy 3 from 3 back
        let stream = [0x00, 0x83, b'a', b'b', b'c', 0xC0, 3, 0, 0x80];
        let mut out = [0u8; 6];
        decompress(&stream, &mut out).unwrap();
        assert_eq!(&out, b"abcabc");
    }

    #[test]
    fn test_underrun_rejected() {
        let stream = [0x82, b'a', b'b', 0x80];
        let mut out = [0u8; 3];
        let err = decompress(&stream, &mut out).unwrap_err();
        assert!(err.to_string().contains("underrun"), "got {err}");
    }

    #[test]
    fn test_overrun_rejected() {
        let stream = [0x83, b'a', b'b', b'c', 0x80];
        let mut out = [0u8; 2];
        assert!(decompress(&stream, &mut out).is_err());

        // trailing command after the output is full
        let stream = [0x82, b'a', b'b', 0x81, b'c'];
        let mut out = [0u8; 2];
        let err = decompress(&stream, &mut out).unwrap_err();
        assert!(err.to_string().contains("overrun"), "got {err}");
    }

    #[test]
    fn test_reference_to_unproduced_output() {
        let stream = [0x81, b'a', 0xC0, 5, 0, 0x80];
        let mut out = [0u8; 4];
        assert!(decompress(&stream, &mut out).is_err());

        let stream = [0x00, 0x81, b'a', 0x00, 0x00, 0x80];
        let mut out = [0u8; 4];
        assert!(decompress(&stream, &mut out).is_err());
    }

    #[test]
    fn test_truncated_command() {
        let stream = [0xFE, 4];
        let mut out = [0u8; 4];
        let err = decompress(&stream, &mut out).unwrap_err();
        assert!(err.to_string().contains("ends inside"), "got {err}");
    }

    #[test]
    fn test_round_trip_uses_all_copy_forms() {
        let mut data = b"solid".repeat(3);
        data.extend(std::iter::repeat(7u8).take(300));
        data.extend(lcg_bytes(200, 7));
        let pattern = lcg_bytes(90, 11);
        data.extend_from_slice(&pattern);
        data.extend(lcg_bytes(5000, 3));
        data.extend_from_slice(&pattern);
        data.extend_from_slice(&pattern[..20]);

        let packed = compress(&data);
        assert!(packed.contains(&FILL));
        assert!(packed.iter().any(|&b| b >= MEDIUM_COPY));
        round_trip(&data);
    }

    #[test]
    fn test_round_trip_edges() {
        round_trip(&[]);
        round_trip(&[42]);
        round_trip(&lcg_bytes(64 * 1024 + 77, 99));
        round_trip(&vec![0u8; 70_000]);
        let tiled: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        round_trip(&tiled);
    }

    #[test]
    fn test_declared_size_mismatch() {
        let data = lcg_bytes(500, 5);
        let packed = compress(&data);
        let mut short = vec![0u8; 499];
        assert!(decompress(&packed, &mut short).is_err());
        let mut long = vec![0u8; 501];
        assert!(decompress(&packed, &mut long).is_err());
    }

    #[test]
    fn test_max_output_len_covers_longest_fill() {
        let fill = [0xFE, 0xFF, 0xFF, 0x5A, 0x80];
        let mut out = vec![0u8; 0xFFFF];
        decompress(&fill, &mut out).unwrap();
        assert!(out.len() <= max_output_len(fill.len()));
        assert_eq!(max_output_len(0), 0);
        assert_eq!(max_output_len(usize::MAX), usize::MAX);
    }
}
