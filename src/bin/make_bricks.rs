use anyhow::{bail, Context};
use seismic_engine::bricking::{BrickedDataset, RawVolume};

const USAGE: &str = "usage: make_bricks <input.bin> <output_dir> [brick_size] [levels]";

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 || args.len() > 4 {
        bail!(USAGE);
    }
    let input = &args[0];
    let output = &args[1];
    let brick_size: usize = match args.get(2) {
        Some(value) => value.parse().with_context(|| format!("invalid brick size {:?}", value))?,
        None => 64,
    };
    let levels: usize = match args.get(3) {
        Some(value) => value.parse().with_context(|| format!("invalid level count {:?}", value))?,
        None => 4,
    };

    println!("Loading {}", input);
    let volume = RawVolume::read(input).with_context(|| format!("reading {}", input))?;
    println!("Loaded volume {:?}", volume.dimensions());

    println!("Normalizing...");
    let volume = volume.normalize();

    let dataset = BrickedDataset::build(&volume, [brick_size; 3], levels)?;
    for level in &dataset.manifest.levels {
        println!(
            "Level {} (1/{}x): {} x {} x {}, {} bricks",
            level.level,
            level.scale_factor,
            level.dimensions[0],
            level.dimensions[1],
            level.dimensions[2],
            level.total_bricks
        );
    }

    dataset
        .write_to_dir(output)
        .with_context(|| format!("writing bricks to {}", output))?;
    println!(
        "Wrote {} bricks ({:.1} MB) to {}",
        dataset.brick_count(),
        dataset.manifest.total_size_bytes as f64 / (1024.0 * 1024.0),
        output
    );
    Ok(())
}
