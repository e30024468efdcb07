//! Offline tile image reducer.
//!
//! Converts an RGBA source image into a deduplicated pool of 8x8 RGB565
//! tiles, optionally reduces the whole pool to a shared color palette
//! under a perceptual error budget, orders the tiles to minimize encoded
//! size, and emits the compact opcode load stream the display hardware
//! consumes.

pub mod color;
pub mod tile;
pub mod tilecodec;

pub use color::{CieLab, ColorReducer, Rgb565};
pub use tile::{
    ColorMode, ConversionError, StackRef, Tile, TileGrid, TilePalette, TilePool, TileRef,
    TileStack, TILE_PIXELS, TILE_SIZE,
};
pub use tilecodec::{CodecReport, RleCodec4, TileCodec, TileCodecLut};
