//! Block-pointer (`VPTR`) expansion.
//!
//! A `VPTR` payload is a sequence of little-endian u16 commands. The top
//! three bits select the opcode:
//!
//! | Op | Fields                              | Effect                              |
//! |----|-------------------------------------|-------------------------------------|
//! | 0  | `n = cmd & 0x1fff`                  | skip `n` destination blocks         |
//! | 1  | `k = (cmd >> 8) & 0x1f`, `b = low8` | block `b` to `2 * (k + 1)` blocks   |
//! | 2  | `k`, `b` as op 1, then `k` bytes    | block `b`, then one block per byte  |
//! | 3  | `b = cmd & 0x1fff`                  | block `b`, opaque                   |
//! | 4  | `b = cmd & 0x1fff`                  | block `b`, keyed                    |
//! | 5  | `b = cmd & 0x1fff`, `m: u8`         | block `b` to `m` blocks, opaque     |
//! | 6  | `b = cmd & 0x1fff`, `m: u8`         | block `b` to `m` blocks, keyed      |
//!
//! Expansion runs in two passes. [`parse`] checks the whole stream against
//! the codebook capacity and the destination grid and produces a list of
//! [`BlockOp`]s; [`apply`] then writes pixels. A stream that fails to parse
//! never touches the raster.

use vqa_core::{Error, Result};

use crate::block::{Codebook, Raster};

/// One validated write: codebook block `src` to `count` consecutive
/// destination blocks starting at `dst`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOp {
    pub src: u16,
    pub dst: u32,
    pub count: u32,
    pub keyed: bool,
}

struct Commands<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Commands<'a> {
    fn u8(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Error::decode(format!("block pointers end inside a command at byte {}", self.pos)))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16> {
        let lo = self.u8()?;
        let hi = self.u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn done(&self) -> bool {
        self.pos >= self.data.len()
    }
}

/// Parse `data` into `ops`, replacing its contents.
///
/// `capacity` is the codebook size in blocks and `grid_blocks` the number of
/// destination blocks per frame.
pub fn parse(data: &[u8], capacity: usize, grid_blocks: usize, ops: &mut Vec<BlockOp>) -> Result<()> {
    ops.clear();
    let mut cmds = Commands { data, pos: 0 };
    let mut dst = 0usize;

    let mut push = |ops: &mut Vec<BlockOp>, dst: &mut usize, src: usize, count: usize, keyed: bool| {
        if src >= capacity {
            return Err(Error::decode(format!(
                "block pointer to codebook block {} beyond capacity {}",
                src, capacity
            )));
        }
        if *dst + count > grid_blocks {
            return Err(Error::decode(format!(
                "block pointers write blocks {}..{} beyond the {} block grid",
                *dst,
                *dst + count,
                grid_blocks
            )));
        }
        ops.push(BlockOp {
            src: src as u16,
            dst: *dst as u32,
            count: count as u32,
            keyed,
        });
        *dst += count;
        Ok(())
    };

    while !cmds.done() {
        let cmd = cmds.u16()?;
        let arg13 = (cmd & 0x1FFF) as usize;
        match cmd >> 13 {
            0 => {
                if dst + arg13 > grid_blocks {
                    return Err(Error::decode(format!(
                        "skip of {} blocks from {} passes the {} block grid",
                        arg13, dst, grid_blocks
                    )));
                }
                dst += arg13;
            }
            1 => {
                let k = ((cmd >> 8) & 0x1F) as usize;
                push(ops, &mut dst, (cmd & 0xFF) as usize, 2 * (k + 1), false)?;
            }
            2 => {
                let k = ((cmd >> 8) & 0x1F) as usize;
                push(ops, &mut dst, (cmd & 0xFF) as usize, 1, false)?;
                for _ in 0..k {
                    let b = cmds.u8()?;
                    push(ops, &mut dst, b as usize, 1, false)?;
                }
            }
            3 => push(ops, &mut dst, arg13, 1, false)?,
            4 => push(ops, &mut dst, arg13, 1, true)?,
            op @ (5 | 6) => {
                let m = cmds.u8()?;
                if m == 0 {
                    return Err(Error::decode("block pointer run of zero blocks"));
                }
                push(ops, &mut dst, arg13, m as usize, op == 6)?;
            }
            _ => {
                return Err(Error::decode(format!(
                    "invalid block pointer opcode 7 (command {:#06x}) at byte {}",
                    cmd,
                    cmds.pos - 2
                )))
            }
        }
    }
    Ok(())
}

/// Write validated `ops` into `raster`.
pub fn apply(ops: &[BlockOp], codebook: &Codebook, raster: &mut Raster) -> Result<()> {
    for op in ops {
        let block = codebook
            .block(op.src as usize)
            .ok_or_else(|| Error::range("codebook block", op.src as usize, codebook.capacity()))?;
        for i in 0..op.count {
            raster.write_block((op.dst + i) as usize, block, op.keyed)?;
        }
    }
    Ok(())
}

/// Parse then apply in one call.
pub fn expand(
    data: &[u8],
    codebook: &Codebook,
    raster: &mut Raster,
    ops: &mut Vec<BlockOp>,
) -> Result<()> {
    parse(data, codebook.capacity(), raster.grid().block_count(), ops)?;
    apply(ops, codebook, raster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockGrid;
    use vqa_core::format::KEY_BIT;

    /// 1×1 blocks on a 4×1 grid, so block n is pixel n.
    fn setup() -> (Codebook, Raster) {
        let mut cb = Codebook::new(1, 4);
        for (n, v) in [10u16, 20, KEY_BIT | 30, 40].iter().enumerate() {
            cb.write_block(n, &[*v]).unwrap();
        }
        let grid = BlockGrid {
            block_w: 1,
            block_h: 1,
            cols: 4,
            rows: 1,
            offset_x: 0,
            offset_y: 0,
        };
        (cb, Raster::new(4, 1, grid))
    }

    fn cmds(words: &[u16]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn run(data: &[u8], cb: &Codebook, raster: &mut Raster) -> Result<()> {
        let mut ops = Vec::new();
        expand(data, cb, raster, &mut ops)
    }

    #[test]
    fn test_each_opcode() {
        let (cb, mut r) = setup();
        // op 1, k = 0: block 1 twice
        run(&cmds(&[0x2001]), &cb, &mut r).unwrap();
        assert_eq!(&r.pixels()[..2], &[20, 20]);

        // op 2, k = 2: block 3, then blocks 0 and 1
        let mut data = cmds(&[0x4203]);
        data.extend_from_slice(&[0, 1]);
        run(&data, &cb, &mut r).unwrap();
        assert_eq!(&r.pixels()[..3], &[40, 10, 20]);

        // skip 3, then op 3 with block 0
        run(&cmds(&[0x0003, 0x6000]), &cb, &mut r).unwrap();
        assert_eq!(r.pixels(), &[40, 10, 20, 10]);

        // op 5: block 3 repeated 4 times
        let mut data = cmds(&[0xA003]);
        data.push(4);
        run(&data, &cb, &mut r).unwrap();
        assert_eq!(r.pixels(), &[40, 40, 40, 40]);
    }

    #[test]
    fn test_keyed_opcodes() {
        let (cb, mut r) = setup();
        run(&cmds(&[0x2000, 0x2000]), &cb, &mut r).unwrap();
        assert_eq!(r.pixels(), &[10, 10, 10, 10]);

        // op 4 with the keyed block leaves the pixel alone
        run(&cmds(&[0x8002]), &cb, &mut r).unwrap();
        assert_eq!(r.pixels()[0], 10);

        // op 3 with the same block copies it verbatim
        run(&cmds(&[0x6002]), &cb, &mut r).unwrap();
        assert_eq!(r.pixels()[0], KEY_BIT | 30);

        // op 6 keyed run over the rest
        let mut data = cmds(&[0x0001, 0xC002]);
        data.push(3);
        run(&data, &cb, &mut r).unwrap();
        assert_eq!(&r.pixels()[1..], &[10, 10, 10]);
    }

    #[test]
    fn test_skip_only_stream_is_identity() {
        let (cb, mut r) = setup();
        run(&cmds(&[0x2003, 0x2001]), &cb, &mut r).unwrap();
        let before = r.clone();
        run(&cmds(&[0x0002, 0x0002]), &cb, &mut r).unwrap();
        assert_eq!(r, before);
        run(&[], &cb, &mut r).unwrap();
        assert_eq!(r, before);
    }

    #[test]
    fn test_deterministic() {
        let (cb, mut a) = setup();
        let mut b = a.clone();
        let mut data = cmds(&[0x4201]);
        data.extend_from_slice(&[2, 3]);
        run(&data, &cb, &mut a).unwrap();
        run(&data, &cb, &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_errors_leave_raster_untouched() {
        let (cb, mut r) = setup();
        run(&cmds(&[0x2001, 0x2001]), &cb, &mut r).unwrap();
        let before = r.clone();

        let cases: Vec<Vec<u8>> = vec![
            // opcode 7 after a valid write
            cmds(&[0x6000, 0xE000]),
            // source block beyond capacity
            cmds(&[0x6004]),
            // op 1, k = 2 writes 6 blocks into a 4 block grid
            cmds(&[0x2200]),
            // skip past the grid
            cmds(&[0x0005]),
            // zero length run
            {
                let mut d = cmds(&[0xA000]);
                d.push(0);
                d
            },
            // run count missing
            cmds(&[0xA000]),
            // op 2 index missing
            cmds(&[0x4100]),
            // odd trailing byte
            vec![0x00, 0x60, 0x01],
        ];
        for data in cases {
            let err = run(&data, &cb, &mut r).unwrap_err();
            assert!(matches!(err, Error::Decode(_)), "{:?}: {}", data, err);
            assert_eq!(r, before);
        }
    }
}
