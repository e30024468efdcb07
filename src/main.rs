use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};

use clap::Parser;
use log::info;

use tilepack::{ConversionError, TileCodec, TileGrid, TilePool, TILE_SIZE};

/// Convert an RGBA image into a deduplicated tile pool and an encoded
/// hardware load stream.
#[derive(Parser, Debug)]
#[command(name = "tilepack", version, about)]
struct Args {
    /// Input image (PNG, or anything else the image crate can decode)
    input: PathBuf,

    /// Output load stream path
    #[arg(short, long, default_value = "tiles.bin")]
    output: PathBuf,

    /// Maximum allowed perceptual error; 0 disables lossy reduction
    #[arg(short, long, default_value_t = 150.0)]
    max_mse: f64,

    /// Write a proof PNG reconstructing the input from the tile pool
    #[arg(long)]
    proof: Option<PathBuf>,

    /// Write a proof PNG of the deduplicated tile pool itself
    #[arg(long)]
    pool_proof: Option<PathBuf>,

    /// Tiles per row in the pool proof image
    #[arg(long, default_value_t = 16)]
    pool_columns: usize,

    /// Write per-mode encoder statistics as JSON
    #[arg(long)]
    stats_json: Option<PathBuf>,

    /// Write a hex listing of the load stream
    #[arg(long)]
    hex: Option<PathBuf>,
}

fn main() -> Result<(), ConversionError> {
    env_logger::init();
    let args = Args::parse();

    let data = fs::read(&args.input)?;
    let mut pool = TilePool::new(args.max_mse);
    let mut grid = TileGrid::new();
    grid.load_image(&mut pool, &data)?;
    info!(
        "loaded {}x{} tiles, {} stacks from {} tiles",
        grid.width(),
        grid.height(),
        pool.len(),
        pool.total_tiles()
    );

    pool.optimize();
    info!("optimized pool holds {} stacks", pool.len());

    let mut codec = TileCodec::new();
    pool.encode(&mut codec);
    codec.dump_statistics();

    if let Some(path) = &args.stats_json {
        serde_json::to_writer_pretty(File::create(path)?, &codec.report())?;
    }

    let stream = codec.into_stream();
    fs::write(&args.output, &stream)?;
    info!("wrote {} bytes to {}", stream.len(), args.output.display());

    if let Some(path) = &args.hex {
        fs::write(path, hex_listing(&stream))?;
    }

    if let Some(path) = &args.proof {
        let width = grid.width() * TILE_SIZE;
        let height = grid.height() * TILE_SIZE;
        let mut rgba = vec![0u8; width * height * 4];
        grid.render(&mut rgba, width * 4);
        save_rgba(path, rgba, width, height)?;
    }

    if let Some(path) = &args.pool_proof {
        let columns = args.pool_columns.max(1);
        let rows = pool.len().div_ceil(columns);
        let width = columns * TILE_SIZE;
        let height = rows.max(1) * TILE_SIZE;
        let mut rgba = vec![0u8; width * height * 4];
        pool.render(&mut rgba, width * 4, columns);
        save_rgba(path, rgba, width, height)?;
    }

    Ok(())
}

fn save_rgba(
    path: &Path,
    rgba: Vec<u8>,
    width: usize,
    height: usize,
) -> Result<(), ConversionError> {
    let img = image::RgbaImage::from_raw(width as u32, height as u32, rgba)
        .expect("proof buffer sized to image");
    img.save(path)?;
    info!("wrote proof image {}", path.display());
    Ok(())
}

/// 16 bytes per line, matching the usual hex viewer width.
fn hex_listing(stream: &[u8]) -> String {
    let mut listing = String::new();
    for chunk in stream.chunks(16) {
        listing.push_str(&hex::encode(chunk));
        listing.push('\n');
    }
    listing
}
