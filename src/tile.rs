//! Tile extraction, deduplication and global optimization.
//!
//! An image is sliced into fixed 8x8 blocks ([`Tile`]), collected into
//! stacks of perceptually similar blocks ([`TileStack`]), and owned by a
//! [`TilePool`] that performs the global palette reduction and tile order
//! optimization passes after ingest. A [`TileGrid`] remembers which stack
//! each position of a source image landed in, for map output and
//! proofing.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::rc::Rc;

use itertools::Itertools;
use log::{debug, info};
use once_cell::unsync::OnceCell;
use thiserror::Error;

use crate::color::{CieLab, ColorReducer, Rgb565};
use crate::tilecodec::{TileCodec, TileCodecLut};

/// Number of pixels on a tile side.
pub const TILE_SIZE: usize = 8;
/// Total pixels in a tile.
pub const TILE_PIXELS: usize = 64;
/// Maximum number of colors an indexed tile palette can hold.
pub const LUT_MAX: usize = 16;

/// The reserved transparent color. The hardware's chroma key test only
/// compares the low 8 bits of each pixel, so opaque colors must keep
/// their low byte away from it.
pub const CHROMA_KEY: u16 = 0x004f;

/// Alpha values below this count as transparent.
const ALPHA_THRESHOLD: u8 = 0x80;

/// Errors that can occur while converting an image into tiles.
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("Image dimensions {0}x{1} are not multiples of tile size {2}x{2}")]
    InvalidDimensions(u32, u32, u32),

    #[error("Decoded image is empty")]
    EmptyImage,

    #[error("Failed to read image: {0}")]
    ImageReadError(#[from] image::ImageError),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Pixel layout of a single tile, used to pick an opcode family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    /// One color; the whole tile is a single LUT entry.
    Lut1,
    /// Up to 2 colors, 1 bit per pixel.
    Lut2,
    /// Up to 4 colors, 2 bits per pixel.
    Lut4,
    /// Up to 16 colors, 4 bits per pixel.
    Lut16,
    /// More than 16 colors; no LUT, pixels are raw 16-bit values.
    True,
}

/// Number of distinct color modes.
pub const COLOR_MODE_COUNT: usize = 5;

impl ColorMode {
    pub const ALL: [ColorMode; COLOR_MODE_COUNT] = [
        ColorMode::Lut1,
        ColorMode::Lut2,
        ColorMode::Lut4,
        ColorMode::Lut16,
        ColorMode::True,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ColorMode::Lut1 => "LUT1",
            ColorMode::Lut2 => "LUT2",
            ColorMode::Lut4 => "LUT4",
            ColorMode::Lut16 => "LUT16",
            ColorMode::True => "TRUE",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// The color palette for one single tile.
///
/// Tiles only carry an indexed palette when they use [`LUT_MAX`] or fewer
/// distinct colors; beyond that the `colors` array is not meaningful.
/// `colors` is ordered by decreasing popularity, which helps color
/// matches survive transitions from higher to lower tile color depth.
#[derive(Debug, Clone)]
pub struct TilePalette {
    pub num_colors: usize,
    pub colors: [Rgb565; LUT_MAX],
}

impl TilePalette {
    pub fn color_mode(&self) -> ColorMode {
        match self.num_colors {
            0..=1 => ColorMode::Lut1,
            2 => ColorMode::Lut2,
            3..=4 => ColorMode::Lut4,
            5..=16 => ColorMode::Lut16,
            _ => ColorMode::True,
        }
    }

    /// Highest LUT slot addressable at this palette's color depth. The
    /// solid-color opcode embeds a full 4-bit index, so it can reach any
    /// slot.
    pub fn max_lut_index(&self) -> usize {
        match self.num_colors {
            0..=1 => 15,
            2 => 1,
            3..=4 => 3,
            _ => 15,
        }
    }

    pub fn has_lut(&self) -> bool {
        self.num_colors <= LUT_MAX
    }
}

/// Shared handle to an immutable tile.
pub type TileRef = Rc<Tile>;

/// One fixed-size image tile in packed RGB565 color.
///
/// Tiles are immutable once constructed; every derived tile (a stack
/// median, a color-reduced copy) is a new instance. Identical content may
/// be shared freely between stacks and caches through [`TileRef`].
pub struct Tile {
    pixels: [Rgb565; TILE_PIXELS],
    using_chroma_key: bool,
    palette: OnceCell<TilePalette>,
}

impl Tile {
    /// Load a tile from a full-color RGBA source bitmap. `stride` is the
    /// source row pitch in bytes.
    pub fn from_rgba(rgba: &[u8], stride: usize) -> Tile {
        // First pass: are there any transparent pixels?
        let mut using_chroma_key = false;
        for y in 0..TILE_SIZE {
            for x in 0..TILE_SIZE {
                if rgba[y * stride + x * 4 + 3] < ALPHA_THRESHOLD {
                    using_chroma_key = true;
                }
            }
        }

        // Second pass: convert to RGB565, possibly with the chroma key.
        let mut pixels = [Rgb565::default(); TILE_PIXELS];
        for y in 0..TILE_SIZE {
            for x in 0..TILE_SIZE {
                let p = &rgba[y * stride + x * 4..y * stride + x * 4 + 4];
                let color = Rgb565::from_rgb(p[0], p[1], p[2]);

                pixels[x + y * TILE_SIZE] = if !using_chroma_key {
                    // No transparency in the tile, any color is allowed.
                    color
                } else if p[3] < ALPHA_THRESHOLD {
                    // Pixel is actually transparent.
                    Rgb565::from_value(CHROMA_KEY)
                } else if color.value & 0xff == CHROMA_KEY & 0xff {
                    // Opaque, but the low byte would read as transparent
                    // to the hardware's 8-bit comparison. Nudge it.
                    color.wiggle()
                } else {
                    color
                };
            }
        }

        Tile::from_pixels(pixels, using_chroma_key)
    }

    /// Build a tile directly from packed pixels.
    pub fn from_pixels(pixels: [Rgb565; TILE_PIXELS], using_chroma_key: bool) -> Tile {
        Tile {
            pixels,
            using_chroma_key,
            palette: OnceCell::new(),
        }
    }

    pub fn using_chroma_key(&self) -> bool {
        self.using_chroma_key
    }

    pub fn pixel(&self, i: usize) -> Rgb565 {
        self.pixels[i]
    }

    pub fn pixel_at(&self, x: usize, y: usize) -> Rgb565 {
        self.pixels[x + y * TILE_SIZE]
    }

    /// Pixel access with toroidal wraparound, for edge-safe convolution.
    pub fn pixel_wrap(&self, x: isize, y: isize) -> Rgb565 {
        self.pixel_at((x & 7) as usize, (y & 7) as usize)
    }

    /// The tile's palette summary, built on first access.
    pub fn palette(&self) -> &TilePalette {
        self.palette.get_or_init(|| self.construct_palette())
    }

    fn construct_palette(&self) -> TilePalette {
        // Count the distinct colors and their frequencies.
        let mut freq: BTreeMap<Rgb565, u32> = BTreeMap::new();
        for &p in &self.pixels {
            *freq.entry(p).or_insert(0) += 1;
        }

        let num_colors = freq.len();
        let mut colors = [Rgb565::default(); LUT_MAX];

        if num_colors <= LUT_MAX {
            // Most popular colors first. Frequency ties break by
            // descending color value, so the ordering is reproducible.
            let order = freq
                .into_iter()
                .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
            for (i, (color, _)) in order.enumerate() {
                colors[i] = color;
            }
        }

        TilePalette { num_colors, colors }
    }

    /// Perceptually weighted tile distance: a structural edge comparison
    /// plus a multi-scale colorimetric MSE. The weights and scales are
    /// tuned against the hardware error budgets; do not adjust them
    /// independently.
    pub fn error_metric(&self, other: &Tile) -> f64 {
        0.30 * self.sobel_error(other)
            + 0.10 * self.mean_squared_error(other, 1)
            + 1.00 * self.mean_squared_error(other, 4)
    }

    /// Lab-space MSE over `scale`-decimated blocks of both tiles. Each
    /// `scale` x `scale` block is averaged before comparison; `scale`
    /// must divide the tile size.
    pub fn mean_squared_error(&self, other: &Tile, scale: usize) -> f64 {
        debug_assert!(TILE_SIZE % scale == 0);
        let blocks = TILE_SIZE / scale;
        let samples = (scale * scale) as f64;
        let mut error = 0.0;

        for by in 0..blocks {
            for bx in 0..blocks {
                let mut a = CieLab::default();
                let mut b = CieLab::default();
                for y in 0..scale {
                    for x in 0..scale {
                        a += CieLab::from(self.pixel_at(bx * scale + x, by * scale + y));
                        b += CieLab::from(other.pixel_at(bx * scale + x, by * scale + y));
                    }
                }
                a /= samples;
                b /= samples;
                error += a.squared_error(b);
            }
        }

        error / (blocks * blocks) as f64
    }

    /// Structural difference of the two tiles' luminance edge maps,
    /// using Sobel gradients with toroidal wraparound at the edges.
    pub fn sobel_error(&self, other: &Tile) -> f64 {
        let mut error = 0.0;

        for y in 0..TILE_SIZE as isize {
            for x in 0..TILE_SIZE as isize {
                let (gx0, gy0) = self.sobel_at(x, y);
                let (gx1, gy1) = other.sobel_at(x, y);
                let gx = gx0 - gx1;
                let gy = gy0 - gy1;
                error += gx * gx + gy * gy;
            }
        }

        error / TILE_PIXELS as f64
    }

    fn sobel_at(&self, x: isize, y: isize) -> (f64, f64) {
        let lum = |x, y| CieLab::from(self.pixel_wrap(x, y)).l;

        // Luminance of the eight neighbor pixels.
        let l00 = lum(x - 1, y - 1);
        let l10 = lum(x, y - 1);
        let l20 = lum(x + 1, y - 1);
        let l01 = lum(x - 1, y);
        let l21 = lum(x + 1, y);
        let l02 = lum(x - 1, y + 1);
        let l12 = lum(x, y + 1);
        let l22 = lum(x + 1, y + 1);

        let gx = -l00 + l20 - 2.0 * l01 + 2.0 * l21 - l02 + l22;
        let gy = -l00 + l02 - 2.0 * l10 + 2.0 * l12 - l20 + l22;
        (gx, gy)
    }

    /// Map every pixel through the reducer's nearest reduced color, with
    /// run hysteresis: the current run color keeps being emitted while
    /// the newly reduced color stays within 90% of the error budget.
    /// Longer runs of identical color compress better downstream.
    pub fn reduce(&self, reducer: &mut ColorReducer, max_mse: f64) -> Tile {
        let max_mse = max_mse * 0.9;
        let mut run = Rgb565::default();
        let mut pixels = [Rgb565::default(); TILE_PIXELS];

        for (i, &p) in self.pixels.iter().enumerate() {
            let color = reducer.nearest(p);
            let error = CieLab::from(color).squared_error(CieLab::from(run));
            if error > max_mse {
                run = color;
            }
            pixels[i] = run;
        }

        Tile::from_pixels(pixels, self.using_chroma_key)
    }

    /// Draw this tile into an RGBA framebuffer, for proofing output.
    pub fn render(&self, rgba: &mut [u8], stride: usize) {
        for y in 0..TILE_SIZE {
            for x in 0..TILE_SIZE {
                let color = self.pixel_at(x, y);
                let dest = &mut rgba[y * stride + x * 4..y * stride + x * 4 + 4];
                dest[0] = color.red();
                dest[1] = color.green();
                dest[2] = color.blue();
                dest[3] = 0xff;
            }
        }
    }
}

/// Shared handle to a mutable tile stack.
pub type StackRef = Rc<RefCell<TileStack>>;

/// Once a stack grows past this many tiles, it is compacted around its
/// median.
const MAX_STACK_SIZE: usize = 128;

/// A stack of perceptually similar tiles, represented at any given time
/// by a per-pixel median over every tile in the set. Adding a similar
/// tile folds its pixels into the statistics behind that median.
pub struct TileStack {
    tiles: Vec<TileRef>,
    median: Option<TileRef>,
    optimized: Option<TileRef>,
}

impl TileStack {
    fn new() -> TileStack {
        TileStack {
            tiles: Vec::new(),
            median: None,
            optimized: None,
        }
    }

    /// Append a tile, invalidating the cached median.
    pub fn add(&mut self, tile: TileRef) {
        self.tiles.push(tile);
        self.median = None;
    }

    /// Number of tiles currently backing this stack.
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// The final color-reduced tile, once palette optimization has run.
    pub fn optimized(&self) -> Option<&TileRef> {
        self.optimized.as_ref()
    }

    /// The stack's consensus tile. Once palette optimization has set the
    /// reduced tile, that tile is authoritative and is always returned.
    pub fn median(&mut self) -> TileRef {
        if let Some(t) = &self.optimized {
            return Rc::clone(t);
        }
        if let Some(t) = &self.median {
            return Rc::clone(t);
        }

        // The median repeats independently for every pixel position:
        // collect the candidate colors, sort them along the dominant Lab
        // axis, and take the middle element.
        let mut pixels = [Rgb565::default(); TILE_PIXELS];
        let mut colors = vec![Rgb565::default(); self.tiles.len()];

        for (i, pixel) in pixels.iter_mut().enumerate() {
            for (j, t) in self.tiles.iter().enumerate() {
                colors[j] = t.pixel(i);
            }
            let major = CieLab::find_major_axis(&colors);
            CieLab::sort_by_axis(&mut colors, major);
            *pixel = colors[colors.len() >> 1];
        }

        let using_chroma_key = self.tiles.iter().any(|t| t.using_chroma_key());
        let median: TileRef = Rc::new(Tile::from_pixels(pixels, using_chroma_key));
        self.median = Some(Rc::clone(&median));

        // Heavily repeated tiles would otherwise grow a stack without
        // bound. Replace an oversized stack with copies of the fresh
        // median, which keeps significant, but not absolute, statistical
        // weight for future additions.
        if self.tiles.len() > MAX_STACK_SIZE {
            self.tiles = vec![Rc::clone(&median); MAX_STACK_SIZE / 2];
        }

        median
    }
}

/// An independent pool of tiles, supporting lossless or lossy reduction.
///
/// `max_mse` controls deduplication aggressiveness; zero disables lossy
/// merging and palette reduction entirely. A pool and the stacks it owns
/// represent one conversion job and are not shareable across jobs.
pub struct TilePool {
    stacks: Vec<StackRef>,
    total_tiles: usize,
    max_mse: f64,
}

impl TilePool {
    pub fn new(max_mse: f64) -> TilePool {
        TilePool {
            stacks: Vec::new(),
            total_tiles: 0,
            max_mse,
        }
    }

    pub fn max_mse(&self) -> f64 {
        self.max_mse
    }

    /// Number of distinct stacks.
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Total tiles ingested via [`TilePool::add`].
    pub fn total_tiles(&self) -> usize {
        self.total_tiles
    }

    /// The pool's stacks, in current (possibly optimized) order.
    pub fn stacks(&self) -> &[StackRef] {
        &self.stacks
    }

    /// Add one tile: merge it into the closest existing stack, or start
    /// a new stack when nothing is within the error threshold.
    pub fn add(&mut self, tile: TileRef) -> StackRef {
        let stack = match self.closest(&tile) {
            Some((stack, distance)) if distance <= self.max_mse => stack,
            _ => {
                let stack: StackRef = Rc::new(RefCell::new(TileStack::new()));
                self.stacks.push(Rc::clone(&stack));
                stack
            }
        };

        stack.borrow_mut().add(tile);
        self.total_tiles += 1;

        if self.total_tiles % 256 == 0 {
            debug!(
                "{} stacks ({:.3}% compression)",
                self.stacks.len(),
                100.0 - self.stacks.len() as f64 * 100.0 / self.total_tiles as f64
            );
        }

        stack
    }

    /// Search for the closest stack to the provided tile image, by the
    /// perceptual error against each stack's current median. Linear
    /// scan; the first stack with the minimum distance wins.
    pub fn closest(&self, tile: &Tile) -> Option<(StackRef, f64)> {
        let mut best: Option<(StackRef, f64)> = None;

        for stack in &self.stacks {
            let median = stack.borrow_mut().median();
            let err = median.error_metric(tile);
            if best.as_ref().map_or(true, |(_, d)| err < *d) {
                best = Some((Rc::clone(stack), err));
            }
        }

        best
    }

    /// Global optimizations to apply after filling the pool. Palette
    /// reduction must run before order optimization, which consumes the
    /// reduced tiles' palettes.
    pub fn optimize(&mut self) {
        if self.max_mse > 0.0 {
            self.optimize_palette();
        }
        self.optimize_order();
    }

    /// Replace every stack's representative tile with a reduced-color
    /// version, built from a single color palette shared by the whole
    /// pool.
    fn optimize_palette(&mut self) {
        let mut reducer = ColorReducer::new();

        // Weight the reducer with every pixel of every median.
        for stack in &self.stacks {
            let median = stack.borrow_mut().median();
            for i in 0..TILE_PIXELS {
                reducer.add(median.pixel(i));
            }
        }

        reducer.reduce(self.max_mse);

        for stack in &self.stacks {
            let mut stack = stack.borrow_mut();
            let median = stack.median();
            stack.optimized = Some(Rc::new(median.reduce(&mut reducer, self.max_mse)));
        }
    }

    /// Optimize the emission order of the stacks. Choosing an order that
    /// minimizes encoded size is an asymmetric travelling salesman
    /// problem, since the cost of each tile depends on the LUT state
    /// left behind by all of its predecessors. A globally optimal answer
    /// is not remotely feasible, so greedily pick the cheapest next
    /// stack, measured by forking the live codec state and simulating
    /// the candidate.
    fn optimize_order(&mut self) {
        info!("optimizing tile order over {} stacks", self.stacks.len());

        let mut remaining = std::mem::take(&mut self.stacks);
        let mut order: Vec<StackRef> = Vec::with_capacity(remaining.len());
        let mut codec = TileCodecLut::new();
        let mut total_cost = 0usize;

        while !remaining.is_empty() {
            let mut best_cost = usize::MAX;
            let mut best_index = 0;

            for (i, stack) in remaining.iter().enumerate() {
                let median = stack.borrow_mut().median();
                let mut fork = codec;
                let (cost, _) = fork.encode(median.palette());
                if cost < best_cost {
                    best_cost = cost;
                    best_index = i;
                }
            }

            // Apply the winner to the live codec state for real.
            let stack = remaining.remove(best_index);
            let median = stack.borrow_mut().median();
            let (cost, _) = codec.encode(median.palette());
            total_cost += cost;
            order.push(stack);

            if order.len() % 128 == 0 {
                debug!("{} tiles ordered (cost {})", order.len(), total_cost);
            }
        }

        debug!("tile order cost {} bytes", total_cost);
        self.stacks = order;
    }

    /// Stream every stack's final tile through a codec, in pool order.
    pub fn encode(&self, codec: &mut TileCodec) {
        for stack in &self.stacks {
            let median = stack.borrow_mut().median();
            codec.encode(&median);
        }
        codec.flush();
    }

    /// Draw every stack's median into an RGBA framebuffer, wrapping to a
    /// new row every `width` tiles. Proofing only.
    pub fn render(&self, rgba: &mut [u8], stride: usize, width: usize) {
        let mut x = 0;
        let mut y = 0;

        for stack in &self.stacks {
            let median = stack.borrow_mut().median();
            median.render(&mut rgba[x * TILE_SIZE * 4 + y * TILE_SIZE * stride..], stride);

            x += 1;
            if x == width {
                x = 0;
                y += 1;
            }
        }
    }
}

/// An image, converted into a matrix of tile stack handles.
#[derive(Default)]
pub struct TileGrid {
    width: usize,
    height: usize,
    cells: Vec<StackRef>,
}

impl TileGrid {
    pub fn new() -> TileGrid {
        TileGrid::default()
    }

    /// Width in tiles.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in tiles.
    pub fn height(&self) -> usize {
        self.height
    }

    /// The stack holding the tile at a grid coordinate.
    pub fn stack(&self, x: usize, y: usize) -> StackRef {
        Rc::clone(&self.cells[x + y * self.width])
    }

    /// Slice an RGBA buffer into tiles and feed them all to the pool.
    /// `width` and `height` are in pixels and must be multiples of the
    /// tile size; `stride` is the row pitch in bytes.
    pub fn load(
        &mut self,
        pool: &mut TilePool,
        rgba: &[u8],
        stride: usize,
        width: usize,
        height: usize,
    ) -> Result<(), ConversionError> {
        if width % TILE_SIZE != 0 || height % TILE_SIZE != 0 {
            return Err(ConversionError::InvalidDimensions(
                width as u32,
                height as u32,
                TILE_SIZE as u32,
            ));
        }

        let grid_width = width / TILE_SIZE;
        let grid_height = height / TILE_SIZE;
        let mut cells = Vec::with_capacity(grid_width * grid_height);

        for y in 0..grid_height {
            for x in 0..grid_width {
                let offset = x * TILE_SIZE * 4 + y * TILE_SIZE * stride;
                let tile = Rc::new(Tile::from_rgba(&rgba[offset..], stride));
                cells.push(pool.add(tile));
            }
        }

        self.width = grid_width;
        self.height = grid_height;
        self.cells = cells;
        Ok(())
    }

    /// Decode an encoded image (PNG or anything else the image crate
    /// recognizes) and load it. Fails without touching the grid or pool
    /// when the data cannot be decoded or has unusable dimensions.
    pub fn load_image(
        &mut self,
        pool: &mut TilePool,
        data: &[u8],
    ) -> Result<(), ConversionError> {
        let decoded = image::load_from_memory(data)?;
        let rgba = decoded.to_rgba8();

        if rgba.width() == 0 || rgba.height() == 0 {
            return Err(ConversionError::EmptyImage);
        }

        let width = rgba.width() as usize;
        let height = rgba.height() as usize;
        self.load(pool, rgba.as_raw(), width * 4, width, height)
    }

    /// Render the reconstructed image from current stack medians, for
    /// proofing output.
    pub fn render(&self, rgba: &mut [u8], stride: usize) {
        for y in 0..self.height {
            for x in 0..self.width {
                let median = self.cells[x + y * self.width].borrow_mut().median();
                median.render(
                    &mut rgba[x * TILE_SIZE * 4 + y * TILE_SIZE * stride..],
                    stride,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// An RGBA buffer filled with one solid color.
    fn solid_rgba(r: u8, g: u8, b: u8, a: u8) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TILE_PIXELS * 4);
        for _ in 0..TILE_PIXELS {
            buf.extend_from_slice(&[r, g, b, a]);
        }
        buf
    }

    fn solid_tile(color: Rgb565) -> Tile {
        Tile::from_pixels([color; TILE_PIXELS], false)
    }

    const RED: Rgb565 = Rgb565 { value: 0xf800 };
    const BLUE: Rgb565 = Rgb565 { value: 0x001f };

    #[test]
    fn solid_opaque_tile_basics() {
        let tile = Tile::from_rgba(&solid_rgba(255, 0, 0, 255), TILE_SIZE * 4);
        assert!(!tile.using_chroma_key());

        let pal = tile.palette();
        assert_eq!(pal.num_colors, 1);
        assert_eq!(pal.colors[0], RED);
        assert_eq!(pal.color_mode(), ColorMode::Lut1);

        assert_eq!(tile.error_metric(&tile), 0.0);
    }

    #[test]
    fn palette_construction_is_idempotent() {
        let mut pixels = [RED; TILE_PIXELS];
        pixels[3] = BLUE;
        pixels[40] = Rgb565::from_rgb(0, 255, 0);
        let tile = Tile::from_pixels(pixels, false);

        let first = tile.palette().clone();
        let second = tile.palette();
        assert_eq!(first.num_colors, second.num_colors);
        assert_eq!(first.colors, second.colors);
    }

    #[test]
    fn palette_orders_by_descending_frequency() {
        let mut pixels = [RED; TILE_PIXELS];
        for p in pixels.iter_mut().take(20) {
            *p = BLUE;
        }
        let tile = Tile::from_pixels(pixels, false);

        let pal = tile.palette();
        assert_eq!(pal.num_colors, 2);
        assert_eq!(pal.colors[0], RED);
        assert_eq!(pal.colors[1], BLUE);
        assert_eq!(pal.color_mode(), ColorMode::Lut2);
    }

    #[test]
    fn transparent_pixels_become_the_chroma_key() {
        let mut buf = solid_rgba(255, 0, 0, 255);
        buf[3] = 0x10; // First pixel transparent
        let tile = Tile::from_rgba(&buf, TILE_SIZE * 4);

        assert!(tile.using_chroma_key());
        assert_eq!(tile.pixel(0).value, CHROMA_KEY);
        assert_eq!(tile.pixel(1), RED);
    }

    #[test]
    fn chroma_key_collisions_are_wiggled() {
        // 0x004f quantizes back from (0, 8, 123) exactly, so this
        // opaque pixel would collide with the key's low byte.
        let mut buf = solid_rgba(0, 8, 123, 255);
        buf[3] = 0x10;
        let tile = Tile::from_rgba(&buf, TILE_SIZE * 4);

        assert!(tile.using_chroma_key());
        assert_eq!(tile.pixel(0).value, CHROMA_KEY);
        assert_ne!(tile.pixel(1).value & 0xff, CHROMA_KEY & 0xff);
        assert_eq!(tile.pixel(1).value, 0x004e);
    }

    #[test]
    fn error_metric_is_symmetric() {
        let a = solid_tile(RED);
        let mut pixels = [RED; TILE_PIXELS];
        pixels[27] = BLUE;
        let b = Tile::from_pixels(pixels, false);

        assert_relative_eq!(a.error_metric(&b), b.error_metric(&a));
        assert!(a.error_metric(&b) > 0.0);
    }

    #[test]
    fn one_changed_pixel_scores_below_all_changed() {
        let base = solid_tile(RED);

        let mut one = [RED; TILE_PIXELS];
        one[27] = BLUE;
        let one = Tile::from_pixels(one, false);
        let all = solid_tile(BLUE);

        let one_err = base.error_metric(&one);
        let all_err = base.error_metric(&all);
        assert!(one_err > 0.0);
        assert!(one_err < all_err);
    }

    #[test]
    fn median_of_three_picks_the_middle() {
        let mut stack = TileStack::new();
        stack.add(Rc::new(solid_tile(Rgb565::from_rgb(10, 10, 10))));
        stack.add(Rc::new(solid_tile(Rgb565::from_rgb(120, 120, 120))));
        stack.add(Rc::new(solid_tile(Rgb565::from_rgb(250, 250, 250))));

        let median = stack.median();
        assert_eq!(median.pixel(0), Rgb565::from_rgb(120, 120, 120));
    }

    #[test]
    fn median_is_cached_until_add() {
        let mut stack = TileStack::new();
        stack.add(Rc::new(solid_tile(RED)));
        stack.add(Rc::new(solid_tile(BLUE)));

        let first = stack.median();
        let second = stack.median();
        assert!(Rc::ptr_eq(&first, &second));

        stack.add(Rc::new(solid_tile(RED)));
        let third = stack.median();
        assert!(!Rc::ptr_eq(&first, &third));
    }

    #[test]
    fn oversized_stack_compacts_around_median() {
        let mut stack = TileStack::new();
        for _ in 0..200 {
            stack.add(Rc::new(solid_tile(RED)));
        }
        let median = stack.median();

        assert_eq!(median.pixel(0), RED);
        assert!(stack.len() <= MAX_STACK_SIZE);
        assert!(!stack.is_empty());
        assert_eq!(stack.len(), MAX_STACK_SIZE / 2);
    }

    #[test]
    fn exact_duplicates_merge_at_zero_threshold() {
        let mut pool = TilePool::new(0.0);
        let a = pool.add(Rc::new(solid_tile(RED)));
        let b = pool.add(Rc::new(solid_tile(RED)));

        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.total_tiles(), 2);
    }

    #[test]
    fn distinct_tiles_stay_apart_at_zero_threshold() {
        let mut pool = TilePool::new(0.0);
        pool.add(Rc::new(solid_tile(RED)));
        pool.add(Rc::new(solid_tile(BLUE)));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn zero_threshold_skips_palette_reduction() {
        let mut pool = TilePool::new(0.0);
        pool.add(Rc::new(solid_tile(RED)));
        pool.add(Rc::new(solid_tile(BLUE)));
        pool.optimize();

        assert_eq!(pool.len(), 2);
        for stack in pool.stacks() {
            assert!(stack.borrow().optimized().is_none());
        }
    }

    #[test]
    fn lossy_pool_sets_optimized_exactly_once() {
        let mut pool = TilePool::new(100.0);
        pool.add(Rc::new(solid_tile(RED)));
        pool.add(Rc::new(solid_tile(BLUE)));
        pool.optimize();

        for stack in pool.stacks() {
            let mut stack = stack.borrow_mut();
            let optimized = Rc::clone(stack.optimized().expect("palette pass ran"));
            // The optimized tile is authoritative from now on.
            assert!(Rc::ptr_eq(&optimized, &stack.median()));
        }
    }

    #[test]
    fn grid_rejects_unaligned_dimensions() {
        let mut pool = TilePool::new(0.0);
        let mut grid = TileGrid::new();
        let rgba = vec![0u8; 12 * 12 * 4];
        let result = grid.load(&mut pool, &rgba, 12 * 4, 12, 12);
        assert!(matches!(
            result,
            Err(ConversionError::InvalidDimensions(12, 12, 8))
        ));
        assert_eq!(pool.total_tiles(), 0);
    }

    #[test]
    fn grid_load_and_render_round_trip() {
        // A 16x8 image: red left tile, blue right tile.
        let width = 16;
        let height = 8;
        let mut rgba = vec![0u8; width * height * 4];
        for y in 0..height {
            for x in 0..width {
                let p = &mut rgba[(x + y * width) * 4..(x + y * width) * 4 + 4];
                if x < 8 {
                    p.copy_from_slice(&[255, 0, 0, 255]);
                } else {
                    p.copy_from_slice(&[0, 0, 255, 255]);
                }
            }
        }

        let mut pool = TilePool::new(0.0);
        let mut grid = TileGrid::new();
        grid.load(&mut pool, &rgba, width * 4, width, height).unwrap();

        assert_eq!(grid.width(), 2);
        assert_eq!(grid.height(), 1);
        assert_eq!(pool.len(), 2);

        let mut out = vec![0u8; width * height * 4];
        grid.render(&mut out, width * 4);
        assert_eq!(&out[..4], &[255, 0, 0, 255]);
        let right = (8usize) * 4;
        assert_eq!(&out[right..right + 4], &[0, 0, 255, 255]);
    }
}
