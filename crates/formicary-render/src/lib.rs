//! Turns committed world state into a packed RGB frame.
//!
//! Background priority per cell is food, then obstacle, then the strongest
//! pheromone mapped through a perceptual colour ramp. Alive ants are painted
//! on top in their colony's colour, and each colony is marked with a small
//! solid square attenuated by its hunger.

use formicary_core::{Rgb, World};

/// Bytes per pixel in the output buffer.
pub const CHANNELS: usize = 3;

const FOOD_PIXEL: Rgb = Rgb::new(0, 255, 0);
const OBSTACLE_PIXEL: Rgb = Rgb::new(128, 128, 128);

/// Strongest pheromone signal visible at a cell: the max over every colony of
/// whichever channel is higher. Falls below zero when no colony exists.
#[must_use]
pub fn pheromone_intensity(world: &World, x: i32, y: i32) -> f64 {
    let mut best = -9999.0f64;
    for colony in world.colonies() {
        let cell = world.pheromones().read(x, y, colony.id as i32);
        best = best.max(cell.to_colony.max(cell.to_food));
    }
    best
}

/// Render the committed world into a `3 * width * height` RGB byte buffer.
#[must_use]
pub fn render_frame(world: &World) -> Vec<u8> {
    let width = world.width();
    let height = world.height();
    let mut frame = Vec::with_capacity((width as usize) * (height as usize) * CHANNELS);

    for y in 0..height {
        for x in 0..width {
            let pixel = if world.food().read(x, y) {
                FOOD_PIXEL
            } else if world.obstacles().read(x, y) {
                OBSTACLE_PIXEL
            } else {
                let intensity = pheromone_intensity(world, x, y).clamp(0.0, 1.0);
                let mapped = colorous::INFERNO.eval_continuous(intensity);
                Rgb::new(mapped.r, mapped.g, mapped.b)
            };
            frame.extend_from_slice(&[pixel.r, pixel.g, pixel.b]);
        }
    }

    for colony in world.colonies() {
        if colony.dead {
            continue;
        }
        for ant in &colony.ants {
            if ant.dead {
                continue;
            }
            paint(&mut frame, width, ant.pos.x, ant.pos.y, colony.colour);
        }

        let half = world.config().render.colony_half_size;
        let marker = colony.colour.scaled(colony.hunger);
        for y in colony.pos.y - half..colony.pos.y + half {
            for x in colony.pos.x - half..colony.pos.x + half {
                if x < 0 || y < 0 || x >= width || y >= height {
                    continue;
                }
                paint(&mut frame, width, x, y, marker);
            }
        }
    }

    frame
}

fn paint(frame: &mut [u8], width: i32, x: i32, y: i32, colour: Rgb) {
    let offset = CHANNELS * (x + width * y) as usize;
    frame[offset] = colour.r;
    frame[offset + 1] = colour.g;
    frame[offset + 2] = colour.b;
}

#[cfg(test)]
mod tests {
    use super::*;
    use formicary_core::{
        COLOUR_EMPTY, COLOUR_FOOD, COLOUR_OBSTACLE, PheromoneStrength, SeedImage, SimConfig, Vec2,
        WorldOptions,
    };

    fn pixel(frame: &[u8], width: i32, x: i32, y: i32) -> [u8; 3] {
        let offset = CHANNELS * (x + width * y) as usize;
        [frame[offset], frame[offset + 1], frame[offset + 2]]
    }

    fn test_world() -> World {
        let mut image = SeedImage::solid(8, 8, COLOUR_EMPTY);
        image.set(1, 1, COLOUR_FOOD);
        image.set(2, 2, COLOUR_OBSTACLE);
        image.set(5, 5, Rgb::new(250, 10, 10));
        let mut config = SimConfig::default();
        config.simulation.rng_seed = 3;
        config.colony.starting_ants = 1;
        config.render.colony_half_size = 1;
        World::from_seed(&image, vec![0.0; 64], config, WorldOptions::default()).expect("world")
    }

    #[test]
    fn frame_has_three_bytes_per_cell() {
        let world = test_world();
        assert_eq!(render_frame(&world).len(), 8 * 8 * CHANNELS);
    }

    #[test]
    fn food_and_obstacles_take_priority() {
        let world = test_world();
        let frame = render_frame(&world);
        assert_eq!(pixel(&frame, 8, 1, 1), [0, 255, 0]);
        assert_eq!(pixel(&frame, 8, 2, 2), [128, 128, 128]);
    }

    #[test]
    fn ants_paint_in_colony_colour() {
        let mut world = test_world();
        world.colonies_mut()[0].ants[0].pos = Vec2::new(7, 0);
        let frame = render_frame(&world);
        assert_eq!(pixel(&frame, 8, 7, 0), [250, 10, 10]);
    }

    #[test]
    fn dead_ants_and_dead_colonies_are_invisible() {
        let mut world = test_world();
        world.colonies_mut()[0].ants[0].pos = Vec2::new(7, 0);
        world.colonies_mut()[0].ants[0].dead = true;
        let frame = render_frame(&world);
        let background = colorous::INFERNO.eval_continuous(0.0);
        assert_eq!(
            pixel(&frame, 8, 7, 0),
            [background.r, background.g, background.b]
        );

        world.colonies_mut()[0].ants[0].dead = false;
        world.colonies_mut()[0].dead = true;
        let frame = render_frame(&world);
        assert_eq!(
            pixel(&frame, 8, 7, 0),
            [background.r, background.g, background.b]
        );
    }

    #[test]
    fn colony_marker_scales_with_hunger() {
        let mut world = test_world();
        world.colonies_mut()[0].hunger = 0.5;
        // keep the ant off the marker so the square is unobscured
        world.colonies_mut()[0].ants[0].pos = Vec2::new(0, 0);
        let frame = render_frame(&world);
        let expected = Rgb::new(250, 10, 10).scaled(0.5);
        assert_eq!(
            pixel(&frame, 8, 4, 4),
            [expected.r, expected.g, expected.b]
        );
        // half size 1 spans [pos - 1, pos + 1): cell (5, 5) is outside only
        // on the high edges
        assert_eq!(
            pixel(&frame, 8, 5, 4),
            [expected.r, expected.g, expected.b],
            "marker is painted over the hunger-scaled square"
        );
    }

    #[test]
    fn pheromone_intensity_is_monotone_in_the_strongest_channel() {
        let mut world = test_world();
        world
            .pheromones_mut()
            .write(6, 6, 0, PheromoneStrength::new(0.2, 0.7));
        world.pheromones_mut().commit();
        assert!((pheromone_intensity(&world, 6, 6) - 0.7).abs() < 1e-12);
        assert_eq!(pheromone_intensity(&world, 0, 7), 0.0);

        let frame = render_frame(&world);
        let strong = colorous::INFERNO.eval_continuous(0.7);
        assert_eq!(pixel(&frame, 8, 6, 6), [strong.r, strong.g, strong.b]);
    }
}
