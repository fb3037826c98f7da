use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use formicary_core::{COLOUR_EMPTY, COLOUR_FOOD, Rgb, SeedImage, SimConfig, World, WorldOptions};
use std::time::Duration;

fn populated_world(side: i32) -> World {
    let mut image = SeedImage::solid(side, side, COLOUR_EMPTY);
    image.set(side / 4, side / 4, Rgb::new(220, 40, 40));
    image.set(3 * side / 4, 3 * side / 4, Rgb::new(40, 40, 220));
    for step in 0..side / 2 {
        image.set(step * 2, side / 2, COLOUR_FOOD);
    }

    let mut config = SimConfig::default();
    config.simulation.rng_seed = 0xBEEF;
    config.colony.starting_ants = 200;
    config.pheromones.fuzz_factor = 1.0;
    config.ants.kill_not_useful = 1_000;

    let cells = (side as usize) * (side as usize);
    let buffer: Vec<f64> = (0..cells)
        .map(|i| ((i * 31) % cells) as f64 / (cells as f64 / 2.0) - 1.0)
        .collect();
    World::from_seed(&image, buffer, config, WorldOptions::default()).expect("world")
}

fn bench_world_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("world_step");
    group.sample_size(20);
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(8));
    for &side in &[64i32, 128, 256] {
        group.bench_function(format!("side{side}_16ticks"), |b| {
            b.iter_batched(
                || populated_world(side),
                |mut world| {
                    for _ in 0..16 {
                        world.step();
                    }
                    world
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_world_steps);
criterion_main!(benches);
