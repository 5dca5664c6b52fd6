use strata::level::core::{BlockUnits, Extent, Point};
use strata::level::ColumnarStore;
use strata::{Config, CubicLevel, HashTerrainGenerator};

use std::sync::Arc;
use std::time::Instant;

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::read_file(path)?,
        None => Config::default(),
    };
    log::info!("Using config:\n{}", config.to_ron()?);

    let store = ColumnarStore::open(&config.store)?;
    let generator = Arc::new(HashTerrainGenerator::new(0xfe1d, config.level.tile_shift));
    let level = CubicLevel::open(&store, &config.level, generator.clone())?;

    let blocks = BlockUnits(Extent::from_min_and_max(Point([-64, 0, -64]), Point([63, 63, 63])));
    let start = Instant::now();
    let cubes = level.prefetch_blocks(blocks, true)?;
    let solid: usize = cubes.iter().map(|c| c.num_solid).sum();
    log::info!(
        "Prefetched {} cubes ({} solid voxels) in {:?}; generated {} columns and {} cubes",
        cubes.len(),
        solid,
        start.elapsed(),
        generator.columns_generated(),
        generator.cubes_generated()
    );
    log::info!("Column stats: {:?}", level.columns.stats());
    log::info!("Cube stats: {:?}", level.cubes.stats());

    level.close()?;
    store.close()?;
    Ok(())
}
