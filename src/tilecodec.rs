//! Stateful encoder producing the hardware load stream.
//!
//! The stream is a sequence of opcodes that reproduces the tile data on
//! the target display hardware: color LUT updates interleaved with
//! paletted RLE-compressed (or raw 16-bit) tile pixel data. The encoder
//! tracks the decoder's LUT state so that consecutive tiles sharing
//! colors and color modes merge into cheap runs.

use log::info;
use serde::Serialize;

use crate::color::Rgb565;
use crate::tile::{ColorMode, Tile, TilePalette, COLOR_MODE_COUNT, LUT_MAX, TILE_PIXELS};

// Low 5 bits of an opcode byte are an argument, upper 3 bits select the
// family.
const OP_MASK: u8 = 0xe0;
const ARG_MASK: u8 = 0x1f;

/// Load a single 16-bit LUT entry (argument is the slot index).
pub const OP_LUT1: u8 = 0x00;
/// Load several LUT entries; a 16-bit slot bitmask follows, then colors.
pub const OP_LUT16: u8 = 0x20;
/// One trivial solid-color tile (argument is the color's LUT index).
pub const OP_TILE_P0: u8 = 0x40;
/// Tiles with 1-bit pixels and 4-bit RLE encoding (argument is count-1).
pub const OP_TILE_P1_R4: u8 = 0x60;
/// Tiles with 2-bit pixels and 4-bit RLE encoding (argument is count-1).
pub const OP_TILE_P2_R4: u8 = 0x80;
/// Tiles with 4-bit pixels and 4-bit RLE encoding (argument is count-1).
pub const OP_TILE_P4_R4: u8 = 0xa0;
/// Tiles with uncompressed 16-bit pixels (argument is count-1).
pub const OP_TILE_P16: u8 = 0xc0;
/// Reserved for special symbols.
pub const OP_SPECIAL: u8 = 0xe0;

/// Breaking a run of tiles costs a new opcode byte.
const RUN_BREAK_COST: usize = 1;
/// Loading one LUT entry costs an opcode/index byte plus a 16-bit color.
const LUT_LOAD_COST: usize = 3;

/// Model of the decoder's color LUT state during encoding.
///
/// Similar to a tile's palette, but tracking what the decoder currently
/// has loaded rather than what one tile uses. Used both for actually
/// encoding tiles and for estimating what a candidate tile would cost
/// against the present state: the struct is a small `Copy` value, and
/// the order optimizer forks it freely to simulate candidates.
#[derive(Clone, Copy)]
pub struct TileCodecLut {
    colors: [Rgb565; LUT_MAX],
    /// Slot indices ordered by recency; oldest at the front, newest at
    /// the end. Always a permutation of all slots.
    mru: [u8; LUT_MAX],
    last_mode: Option<ColorMode>,
}

impl Default for TileCodecLut {
    fn default() -> Self {
        Self::new()
    }
}

impl TileCodecLut {
    pub fn new() -> Self {
        let mut mru = [0u8; LUT_MAX];
        for (i, slot) in mru.iter_mut().enumerate() {
            *slot = i as u8;
        }
        TileCodecLut {
            colors: [Rgb565::default(); LUT_MAX],
            mru,
            last_mode: None,
        }
    }

    /// The color currently loaded in a slot.
    pub fn color(&self, slot: usize) -> Rgb565 {
        self.colors[slot]
    }

    /// Find a loaded color, scanning slots 0 through `max_index`.
    pub fn find_color(&self, color: Rgb565, max_index: usize) -> Option<usize> {
        self.colors
            .iter()
            .take(max_index + 1)
            .position(|&c| c == color)
    }

    /// Modify the LUT state to accommodate the given tile palette, and
    /// measure the associated cost in bytes. Returns the cost and a
    /// bitmask of the newly loaded slots.
    pub fn encode(&mut self, pal: &TilePalette) -> (usize, u16) {
        let mode = pal.color_mode();
        let max_lut_index = pal.max_lut_index();
        let mut cost = 0;
        let mut new_colors: u16 = 0;

        if pal.has_lut() {
            // Walk the tile's colors least popular first, so that the
            // most popular colors end up newest in the MRU list.
            let mut missing: Vec<Rgb565> = Vec::new();

            for c in (0..pal.num_colors).rev() {
                let color = pal.colors[c];
                match self.find_color(color, max_lut_index) {
                    Some(index) => {
                        // Already loaded and reachable; mark it as the
                        // most recently used slot.
                        for i in 0..LUT_MAX - 1 {
                            if self.mru[i] == index as u8 {
                                self.bump_mru(i, index as u8);
                                break;
                            }
                        }
                    }
                    None => missing.push(color),
                }
            }

            // Load what's missing, most popular first, overwriting the
            // stalest slots this tile's color depth can address.
            while let Some(color) = missing.pop() {
                let slot = self.evict(max_lut_index);
                self.colors[slot] = color;
                new_colors |= 1 << slot;
                cost += LUT_LOAD_COST;
            }
        }

        // A mode switch or any reload forces a new opcode boundary.
        if self.last_mode != Some(mode) || cost != 0 {
            cost += RUN_BREAK_COST;
        }
        self.last_mode = Some(mode);

        (cost, new_colors)
    }

    /// Claim the least recently used slot reachable at the given color
    /// depth, marking it most recently used.
    fn evict(&mut self, max_lut_index: usize) -> usize {
        for i in 0..LUT_MAX {
            let slot = self.mru[i];
            if slot as usize <= max_lut_index {
                self.bump_mru(i, slot);
                return slot as usize;
            }
        }
        unreachable!("the MRU list always contains slot 0");
    }

    fn bump_mru(&mut self, mut mru_index: usize, slot: u8) {
        while mru_index < LUT_MAX - 1 {
            self.mru[mru_index] = self.mru[mru_index + 1];
            mru_index += 1;
        }
        self.mru[LUT_MAX - 1] = slot;
    }
}

/// Maximum run length the count nybble can express.
const MAX_RUN: usize = 15;

/// A nybble-wise run length codec. Nybbles are handy because the target
/// can rotate 4 bits quickly, and 4 bits is a good size for run length
/// counts. Every time two identical nybbles are emitted, a third follows
/// with a count of additional repeats. Nybbles pack into bytes least
/// significant first.
pub struct RleCodec4 {
    run_nybble: u8,
    run_count: usize,
    buffered_nybble: u8,
    nybble_buffered: bool,
}

impl Default for RleCodec4 {
    fn default() -> Self {
        Self::new()
    }
}

impl RleCodec4 {
    pub fn new() -> Self {
        RleCodec4 {
            run_nybble: 0,
            run_count: 0,
            buffered_nybble: 0,
            nybble_buffered: false,
        }
    }

    /// Add one nybble to the pending run, flushing the run first if the
    /// symbol changes or the run is full.
    pub fn encode(&mut self, nybble: u8, out: &mut Vec<u8>) {
        debug_assert!(nybble < 0x10);
        if nybble != self.run_nybble || self.run_count == MAX_RUN {
            self.encode_run(out);
        }
        self.run_nybble = nybble;
        self.run_count += 1;
    }

    /// Emit the pending run and drain the nybble buffer, padding with a
    /// zero nybble when an odd number of nybbles were produced. Must end
    /// every encoding session.
    pub fn flush(&mut self, out: &mut Vec<u8>) {
        self.encode_run(out);
        if self.nybble_buffered {
            self.encode_nybble(0, out);
        }
    }

    fn encode_run(&mut self, out: &mut Vec<u8>) {
        if self.run_count > 0 {
            self.encode_nybble(self.run_nybble, out);
            if self.run_count > 1 {
                self.encode_nybble(self.run_nybble, out);
                self.encode_nybble((self.run_count - 2) as u8, out);
            }
        }
        self.run_count = 0;
    }

    fn encode_nybble(&mut self, value: u8, out: &mut Vec<u8>) {
        if self.nybble_buffered {
            out.push(self.buffered_nybble | (value << 4));
            self.nybble_buffered = false;
        } else {
            self.buffered_nybble = value;
            self.nybble_buffered = true;
        }
    }
}

/// Per-color-mode encoder statistics.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ModeStats {
    pub opcodes: usize,
    pub tiles: usize,
    pub data_bytes: usize,
}

impl ModeStats {
    /// Percent saved against raw 16-bit-per-pixel tile data. Zero when
    /// no tiles were encoded in this mode.
    pub fn compression_ratio(&self) -> f64 {
        let compressed = self.data_bytes + self.opcodes;
        let uncompressed = self.tiles * TILE_PIXELS * 2;
        if uncompressed == 0 {
            0.0
        } else {
            100.0 - compressed as f64 * 100.0 / uncompressed as f64
        }
    }
}

/// Machine-readable form of the statistics dump.
#[derive(Debug, Serialize)]
pub struct CodecReport {
    pub modes: Vec<ModeReport>,
    pub stream_bytes: usize,
}

#[derive(Debug, Serialize)]
pub struct ModeReport {
    pub mode: &'static str,
    pub opcodes: usize,
    pub tiles: usize,
    pub data_bytes: usize,
    pub compression_pct: f64,
}

/// A stateful compressor for streams of tile data.
///
/// Tiles must arrive already finalized (color reduced) and in their
/// final emission order. The encoder buffers one opcode and its payload
/// at a time, extending the opcode's run argument while consecutive
/// tiles share a family, and flushes the pending run whenever a new
/// opcode becomes necessary.
pub struct TileCodec {
    out: Vec<u8>,
    data_buf: Vec<u8>,
    pending_op: Option<u8>,
    run_tiles: usize,
    stat_bucket: Option<ColorMode>,
    stats: [ModeStats; COLOR_MODE_COUNT],
    lut: TileCodecLut,
    rle: RleCodec4,
}

impl Default for TileCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl TileCodec {
    pub fn new() -> Self {
        TileCodec {
            out: Vec::new(),
            data_buf: Vec::new(),
            pending_op: None,
            run_tiles: 0,
            stat_bucket: None,
            stats: [ModeStats::default(); COLOR_MODE_COUNT],
            lut: TileCodecLut::new(),
            rle: RleCodec4::new(),
        }
    }

    /// Encode one tile into the stream.
    pub fn encode(&mut self, tile: &Tile) {
        // LUT changes go out first, so the decoder's palette is current
        // before any pixel data that references it.
        let pal = tile.palette();
        let (_, new_colors) = self.lut.encode(pal);
        if new_colors != 0 {
            self.encode_lut_update(new_colors);
        }

        let mode = pal.color_mode();
        let tile_opcode = match mode {
            ColorMode::Lut1 => {
                // Trivial solid tile: the opcode argument carries the
                // one color's LUT index, and there is no payload.
                let index = self
                    .lut
                    .find_color(pal.colors[0], LUT_MAX - 1)
                    .expect("solid color was just loaded") as u8;
                self.encode_op(OP_TILE_P0 | index);
                self.new_stats_tile(mode);
                return;
            }
            ColorMode::Lut2 => OP_TILE_P1_R4,
            ColorMode::Lut4 => OP_TILE_P2_R4,
            ColorMode::Lut16 => OP_TILE_P4_R4,
            ColorMode::True => OP_TILE_P16,
        };

        // Emit a new opcode only if this run has to break; otherwise
        // extend the pending opcode's run argument.
        match self.pending_op {
            Some(op) if op & OP_MASK == tile_opcode && op & ARG_MASK != ARG_MASK => {
                self.pending_op = Some(op + 1);
            }
            _ => self.encode_op(tile_opcode),
        }

        self.new_stats_tile(mode);

        match tile_opcode {
            OP_TILE_P1_R4 => self.encode_tile_rle(tile, 1),
            OP_TILE_P2_R4 => self.encode_tile_rle(tile, 2),
            OP_TILE_P4_R4 => self.encode_tile_rle(tile, 4),
            _ => self.encode_tile_true(tile),
        }
    }

    /// Write the pending opcode and payload to the output stream and
    /// record its statistics. Must be called once after the last tile.
    pub fn flush(&mut self) {
        let Some(op) = self.pending_op.take() else {
            return;
        };

        self.rle.flush(&mut self.data_buf);

        if let Some(bucket) = self.stat_bucket {
            let stats = &mut self.stats[bucket.index()];
            stats.opcodes += 1;
            stats.data_bytes += self.data_buf.len();
            stats.tiles += self.run_tiles;
            self.run_tiles = 0;
        }

        self.out.push(op);
        self.out.append(&mut self.data_buf);
    }

    /// Flush and take the completed stream.
    pub fn into_stream(mut self) -> Vec<u8> {
        self.flush();
        self.out
    }

    /// Bytes written to the stream so far, excluding any pending run.
    pub fn stream_len(&self) -> usize {
        self.out.len()
    }

    pub fn stats(&self) -> &[ModeStats; COLOR_MODE_COUNT] {
        &self.stats
    }

    /// Per-mode accounting in serializable form.
    pub fn report(&self) -> CodecReport {
        CodecReport {
            modes: ColorMode::ALL
                .iter()
                .map(|&mode| {
                    let s = self.stats[mode.index()];
                    ModeReport {
                        mode: mode.name(),
                        opcodes: s.opcodes,
                        tiles: s.tiles,
                        data_bytes: s.data_bytes,
                        compression_pct: s.compression_ratio(),
                    }
                })
                .collect(),
            stream_bytes: self.out.len(),
        }
    }

    /// Log the per-mode accounting for the whole stream.
    pub fn dump_statistics(&self) {
        info!("tile encoder statistics:");
        for &mode in &ColorMode::ALL {
            let s = self.stats[mode.index()];
            info!(
                "{:>6}: {:4} ops, {:4} tiles, {:5} bytes, {:5.1}% compression",
                mode.name(),
                s.opcodes,
                s.tiles,
                s.data_bytes,
                s.compression_ratio()
            );
        }
    }

    fn encode_op(&mut self, op: u8) {
        self.flush();
        self.pending_op = Some(op);
    }

    fn new_stats_tile(&mut self, mode: ColorMode) {
        self.stat_bucket = Some(mode);
        self.run_tiles += 1;
    }

    /// Append a 16-bit word to the payload, low byte first.
    fn encode_word(&mut self, word: u16) {
        self.data_buf.push(word as u8);
        self.data_buf.push((word >> 8) as u8);
    }

    fn encode_lut_update(&mut self, new_colors: u16) {
        if new_colors & (new_colors - 1) != 0 {
            // Several slots changed. Emit the bitmask form, with each
            // changed slot's color in ascending slot order.
            self.encode_op(OP_LUT16);
            self.encode_word(new_colors);
            for slot in 0..LUT_MAX {
                if new_colors & (1 << slot) != 0 {
                    self.encode_word(self.lut.color(slot).value);
                }
            }
        } else {
            // Exactly one new color; the slot fits the opcode argument.
            let slot = new_colors.trailing_zeros() as usize;
            self.encode_op(OP_LUT1 | slot as u8);
            self.encode_word(self.lut.color(slot).value);
        }
    }

    /// Indexed pixels packed into nybbles, then run length encoded.
    fn encode_tile_rle(&mut self, tile: &Tile, bits: usize) {
        let mut nybble = 0u8;
        let mut bit_index = 0;

        for i in 0..TILE_PIXELS {
            let index = self
                .lut
                .find_color(tile.pixel(i), LUT_MAX - 1)
                .expect("tile color missing from the LUT");
            assert!(index < 1 << bits);

            nybble |= (index as u8) << bit_index;
            bit_index += bits;

            if bit_index == 4 {
                self.rle.encode(nybble, &mut self.data_buf);
                nybble = 0;
                bit_index = 0;
            }
        }
    }

    /// Raw 16-bit pixels, low byte first.
    fn encode_tile_true(&mut self, tile: &Tile) {
        for i in 0..TILE_PIXELS {
            self.encode_word(tile.pixel(i).value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn palette(colors: &[Rgb565]) -> TilePalette {
        let mut pal = TilePalette {
            num_colors: colors.len(),
            colors: [Rgb565::default(); LUT_MAX],
        };
        pal.colors[..colors.len()].copy_from_slice(colors);
        pal
    }

    fn solid_tile(color: Rgb565) -> Tile {
        Tile::from_pixels([color; TILE_PIXELS], false)
    }

    const RED: Rgb565 = Rgb565 { value: 0xf800 };
    const GREEN: Rgb565 = Rgb565 { value: 0x07e0 };
    const BLUE: Rgb565 = Rgb565 { value: 0x001f };

    /// Decode `count` nybbles of RLE output, low nybble first.
    fn rle_decode(bytes: &[u8], count: usize) -> Vec<u8> {
        let mut nybbles = Vec::new();
        for &b in bytes {
            nybbles.push(b & 0x0f);
            nybbles.push(b >> 4);
        }

        let mut out = Vec::new();
        let mut i = 0;
        while out.len() < count {
            let symbol = nybbles[i];
            i += 1;
            if i < nybbles.len() && nybbles[i] == symbol {
                i += 1;
                let repeats = nybbles[i] as usize;
                i += 1;
                for _ in 0..repeats + 2 {
                    out.push(symbol);
                }
            } else {
                out.push(symbol);
            }
        }
        out.truncate(count);
        out
    }

    #[test]
    fn rle_round_trips_arbitrary_nybbles() {
        let input: Vec<u8> = vec![
            0, 0, 0, 0, 0, 1, 2, 2, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 7, 7, 1,
            0, 0, 15, 15, 15, 4,
        ];
        let mut rle = RleCodec4::new();
        let mut out = Vec::new();
        for &n in &input {
            rle.encode(n, &mut out);
        }
        rle.flush(&mut out);

        assert_eq!(rle_decode(&out, input.len()), input);
    }

    #[test]
    fn rle_run_of_two_emits_zero_count() {
        let mut rle = RleCodec4::new();
        let mut out = Vec::new();
        rle.encode(5, &mut out);
        rle.encode(5, &mut out);
        rle.flush(&mut out);

        // Nybbles 5, 5, 0 then a zero pad: bytes 0x55, 0x00.
        assert_eq!(out, vec![0x55, 0x00]);
    }

    #[test]
    fn lut_repeat_palette_costs_at_most_a_run_break() {
        let pal = palette(&[RED, GREEN, BLUE]);
        let mut lut = TileCodecLut::new();

        let (first_cost, first_new) = lut.encode(&pal);
        assert_eq!(first_new.count_ones(), 3);
        assert!(first_cost >= 3 * 3);

        let (second_cost, second_new) = lut.encode(&pal);
        assert_eq!(second_new, 0);
        assert!(second_cost <= 1);
    }

    #[test]
    fn lut_eviction_respects_reachability() {
        let mut lut = TileCodecLut::new();

        // Fill all 16 slots.
        let full: Vec<Rgb565> = (1..=16).map(|v| Rgb565::from_value(v * 0x0841)).collect();
        lut.encode(&palette(&full));

        // A 2-color tile can only address slots 0 and 1.
        let (_, new_colors) = lut.encode(&palette(&[RED, BLUE]));
        assert_eq!(new_colors & !0x0003, 0);
        assert_eq!(new_colors.count_ones(), 2);
        assert_eq!(lut.find_color(RED, 1), lut.find_color(RED, LUT_MAX - 1));
    }

    #[test]
    fn lut_mode_switch_costs_one_byte() {
        let mut lut = TileCodecLut::new();
        lut.encode(&palette(&[RED]));

        // Same colors loaded, different mode: only the run break.
        let (cost, new_colors) = lut.encode(&palette(&[RED, Rgb565::default()]));
        assert_eq!(new_colors, 0);
        assert_eq!(cost, 1);
    }

    #[test]
    fn solid_tiles_share_one_lut_load() {
        let mut codec = TileCodec::new();
        let tile = solid_tile(RED);
        for _ in 0..5 {
            codec.encode(&tile);
        }
        let stream = codec.into_stream();

        // One OP_LUT1 with its color word, then five solid-tile opcodes.
        assert_eq!(stream.len(), 8);
        assert_eq!(stream[0], OP_LUT1);
        assert_eq!(&stream[1..3], &[0x00, 0xf8]);
        for &op in &stream[3..] {
            assert_eq!(op, OP_TILE_P0);
        }
    }

    #[test]
    fn two_color_tiles_merge_into_one_run() {
        let mut pixels = [RED; TILE_PIXELS];
        for p in pixels.iter_mut().skip(32) {
            *p = BLUE;
        }
        let tile = Tile::from_pixels(pixels, false);

        let mut codec = TileCodec::new();
        for _ in 0..3 {
            codec.encode(&tile);
        }
        codec.flush();

        let stats = codec.stats()[ColorMode::Lut2.index()];
        assert_eq!(stats.tiles, 3);
        assert_eq!(stats.opcodes, 1);

        let stream = codec.into_stream();
        // The multi-color LUT load comes first, then a single P1 run
        // opcode with count-1 == 2.
        assert_eq!(stream[0], OP_LUT16);
        let run_op = stream
            .iter()
            .find(|&&b| b & OP_MASK == OP_TILE_P1_R4)
            .copied()
            .expect("tile run opcode present");
        assert_eq!(run_op & ARG_MASK, 2);
    }

    #[test]
    fn run_argument_saturates_at_32_tiles() {
        let mut pixels = [RED; TILE_PIXELS];
        for p in pixels.iter_mut().skip(32) {
            *p = BLUE;
        }
        let tile = Tile::from_pixels(pixels, false);

        let mut codec = TileCodec::new();
        for _ in 0..33 {
            codec.encode(&tile);
        }
        codec.flush();

        let stats = codec.stats()[ColorMode::Lut2.index()];
        assert_eq!(stats.tiles, 33);
        assert_eq!(stats.opcodes, 2);
    }

    #[test]
    fn true_color_tiles_emit_raw_pixels() {
        let mut pixels = [Rgb565::default(); TILE_PIXELS];
        for (i, p) in pixels.iter_mut().enumerate() {
            // 17 distinct values, repeating; too many for a LUT.
            *p = Rgb565::from_value(0x0100 + (i % 17) as u16);
        }
        let tile = Tile::from_pixels(pixels, false);
        assert_eq!(tile.palette().color_mode(), ColorMode::True);

        let mut codec = TileCodec::new();
        codec.encode(&tile);
        let stream = codec.into_stream();

        // One opcode plus 64 raw 16-bit pixels, low byte first.
        assert_eq!(stream.len(), 1 + TILE_PIXELS * 2);
        assert_eq!(stream[0], OP_TILE_P16);
        assert_eq!(stream[1], 0x00);
        assert_eq!(stream[2], 0x01);
    }

    #[test]
    fn statistics_guard_division_by_zero() {
        let codec = TileCodec::new();
        for &mode in &ColorMode::ALL {
            assert_eq!(codec.stats()[mode.index()].compression_ratio(), 0.0);
        }
    }
}
