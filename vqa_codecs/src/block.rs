use byteorder::{ByteOrder, LittleEndian};
use vqa_core::{Error, Result, VqaHeader};
use vqa_core::format::KEY_BIT;

/// Block layout of the visible image: `cols × rows` blocks, left-to-right,
/// top-to-bottom, shifted once by the header's x/y offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGrid {
    pub block_w: usize,
    pub block_h: usize,
    pub cols: usize,
    pub rows: usize,
    pub offset_x: usize,
    pub offset_y: usize,
}

impl BlockGrid {
    pub fn from_header(header: &VqaHeader) -> Self {
        Self {
            block_w: header.block_w as usize,
            block_h: header.block_h as usize,
            cols: header.grid_cols(),
            rows: header.grid_rows(),
            offset_x: header.offset_x as usize,
            offset_y: header.offset_y as usize,
        }
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.cols * self.rows
    }

    #[inline]
    pub fn block_pixels(&self) -> usize {
        self.block_w * self.block_h
    }

    /// Top-left pixel of destination block `n`.
    #[inline]
    pub fn origin(&self, n: usize) -> (usize, usize) {
        (
            self.offset_x + (n % self.cols) * self.block_w,
            self.offset_y + (n / self.cols) * self.block_h,
        )
    }
}

// ── Codebook ───────────────────────────────────────────────────────────────

/// Fixed-capacity table of 16-bit pixel blocks.
///
/// Allocated once from the header's `max_blocks`; updates overwrite blocks in
/// place and never reallocate.
#[derive(Debug, Clone)]
pub struct Codebook {
    block_pixels: usize,
    capacity: usize,
    words: Vec<u16>,
}

impl Codebook {
    pub fn new(block_pixels: usize, capacity: usize) -> Self {
        Self {
            block_pixels,
            capacity,
            words: vec![0; block_pixels * capacity],
        }
    }

    /// Capacity in blocks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn block_pixels(&self) -> usize {
        self.block_pixels
    }

    /// Capacity in bytes, i.e. the size of a full decompressed update.
    pub fn byte_len(&self) -> usize {
        self.words.len() * 2
    }

    pub fn block(&self, n: usize) -> Option<&[u16]> {
        let start = n.checked_mul(self.block_pixels)?;
        self.words.get(start..start + self.block_pixels)
    }

    /// Overwrite consecutive blocks from little-endian pixel bytes.
    pub fn write_blocks(&mut self, first: usize, bytes: &[u8]) -> Result<()> {
        let block_bytes = self.block_pixels * 2;
        if bytes.len() % block_bytes != 0 {
            return Err(Error::decode(format!(
                "codebook update of {} bytes is not a whole number of {} byte blocks",
                bytes.len(),
                block_bytes
            )));
        }
        let count = bytes.len() / block_bytes;
        if first + count > self.capacity {
            return Err(Error::decode(format!(
                "codebook update of blocks {}..{} exceeds capacity {}",
                first,
                first + count,
                self.capacity
            )));
        }
        let start = first * self.block_pixels;
        LittleEndian::read_u16_into(bytes, &mut self.words[start..start + bytes.len() / 2]);
        Ok(())
    }

    pub fn write_block(&mut self, n: usize, pixels: &[u16]) -> Result<()> {
        if pixels.len() != self.block_pixels {
            return Err(Error::decode(format!(
                "block of {} pixels, expected {}",
                pixels.len(),
                self.block_pixels
            )));
        }
        let start = n * self.block_pixels;
        let dst = self
            .words
            .get_mut(start..start + self.block_pixels)
            .ok_or_else(|| Error::range("codebook block", n, self.capacity))?;
        dst.copy_from_slice(pixels);
        Ok(())
    }
}

// ── Raster ─────────────────────────────────────────────────────────────────

/// The current frame: `width × height` 16-bit pixels (x1rrrrrgggggbbbbb),
/// updated in place by every decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    width: usize,
    height: usize,
    grid: BlockGrid,
    pixels: Vec<u16>,
}

impl Raster {
    pub fn new(width: usize, height: usize, grid: BlockGrid) -> Self {
        Self {
            width,
            height,
            grid,
            pixels: vec![0; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn grid(&self) -> &BlockGrid {
        &self.grid
    }

    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    pub fn pixel(&self, x: usize, y: usize) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get(y * self.width + x).copied()
    }

    /// Copy destination block `n` into `out` (row-major, `block_pixels` long).
    pub fn read_block(&self, n: usize, out: &mut [u16]) -> Result<()> {
        self.check_block(n, out.len())?;
        let (x0, y0) = self.grid.origin(n);
        for (row, chunk) in out.chunks_exact_mut(self.grid.block_w).enumerate() {
            let start = (y0 + row) * self.width + x0;
            chunk.copy_from_slice(&self.pixels[start..start + self.grid.block_w]);
        }
        Ok(())
    }

    /// Write `src` over destination block `n`.
    ///
    /// With `keyed`, source pixels that have [`KEY_BIT`] set are skipped and
    /// the destination keeps its previous value.
    pub fn write_block(&mut self, n: usize, src: &[u16], keyed: bool) -> Result<()> {
        self.check_block(n, src.len())?;
        let (x0, y0) = self.grid.origin(n);
        let bw = self.grid.block_w;
        for (row, line) in src.chunks_exact(bw).enumerate() {
            let start = (y0 + row) * self.width + x0;
            let dst = &mut self.pixels[start..start + bw];
            if keyed {
                for (d, &s) in dst.iter_mut().zip(line) {
                    if s & KEY_BIT == 0 {
                        *d = s;
                    }
                }
            } else {
                dst.copy_from_slice(line);
            }
        }
        Ok(())
    }

    fn check_block(&self, n: usize, len: usize) -> Result<()> {
        if n >= self.grid.block_count() {
            return Err(Error::range("destination block", n, self.grid.block_count()));
        }
        if len != self.grid.block_pixels() {
            return Err(Error::decode(format!(
                "block of {} pixels, expected {}",
                len,
                self.grid.block_pixels()
            )));
        }
        Ok(())
    }

    /// Pixels as little-endian bytes, the layout codebooks use on disk.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.pixels.len() * 2];
        LittleEndian::write_u16_into(&self.pixels, &mut out);
        out
    }

    /// Expand to packed 8-bit RGB, ignoring the key bit.
    pub fn to_rgb888(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pixels.len() * 3);
        for &p in &self.pixels {
            out.extend_from_slice(&rgb555_to_rgb888(p));
        }
        out
    }
}

#[inline]
pub fn rgb555_to_rgb888(p: u16) -> [u8; 3] {
    let r = ((p >> 10) & 0x1F) as u8;
    let g = ((p >> 5) & 0x1F) as u8;
    let b = (p & 0x1F) as u8;
    [(r << 3) | (r >> 2), (g << 3) | (g >> 2), (b << 3) | (b >> 2)]
}
