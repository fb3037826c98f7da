//! Writes the pre-generated random resource the decay phase indexes into:
//! `width * height` little-endian IEEE-754 doubles drawn uniformly from
//! [-1, 1].

use anyhow::{Context, Result};
use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dump-random", version, about = "Generate the decay-noise resource")]
struct Cli {
    /// RNG seed for the dump.
    seed: u64,
    /// Grid width the resource is generated for.
    width: u32,
    /// Grid height the resource is generated for.
    height: u32,
    /// Output file.
    #[arg(long, default_value = "random.bin")]
    output: PathBuf,
}

fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let cli = Cli::parse();
    info!(seed = cli.seed, width = cli.width, height = cli.height, "dumping random resource");

    let file = File::create(&cli.output)
        .with_context(|| format!("failed to create {}", cli.output.display()))?;
    let mut out = BufWriter::new(file);
    write_resource(&mut out, cli.seed, cli.width, cli.height)?;
    out.flush()?;
    info!(path = %cli.output.display(), "done");
    Ok(())
}

fn write_resource<W: Write>(out: &mut W, seed: u64, width: u32, height: u32) -> Result<()> {
    let mut rng = Pcg32::seed_from_u64(seed);
    for _ in 0..u64::from(width) * u64::from(height) {
        let value: f64 = rng.random_range(-1.0..1.0);
        out.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(seed: u64, width: u32, height: u32) -> Vec<f64> {
        let mut bytes = Vec::new();
        write_resource(&mut bytes, seed, width, height).expect("write");
        bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect()
    }

    #[test]
    fn resource_holds_one_double_per_cell_in_unit_range() {
        let dump = values(42, 16, 9);
        assert_eq!(dump.len(), 16 * 9);
        assert!(dump.iter().all(|value| (-1.0..=1.0).contains(value)));
    }

    #[test]
    fn resource_is_seed_deterministic() {
        assert_eq!(values(7, 8, 8), values(7, 8, 8));
        assert_ne!(values(7, 8, 8), values(8, 8, 8));
    }
}
