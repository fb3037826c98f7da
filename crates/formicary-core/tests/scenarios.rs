//! End-to-end behavioural scenarios on small hand-built worlds.

use formicary_core::{
    COLOUR_EMPTY, COLOUR_FOOD, COLOUR_OBSTACLE, HaltReason, Rgb, SeedImage, SimConfig, Vec2,
    World, WorldOptions,
};

const COLONY_RED: Rgb = Rgb::new(200, 30, 30);

fn zeros(width: i32, height: i32) -> Vec<f64> {
    vec![0.0; (width as usize) * (height as usize)]
}

fn base_config() -> SimConfig {
    let mut config = SimConfig::default();
    config.simulation.rng_seed = 41;
    config.colony.starting_ants = 1;
    config.colony.ants_per_tick = 2;
    config.colony.hunger_drain = 0.0;
    config.colony.hunger_replenish = 0.1;
    config.colony.return_distance = 0;
    config.pheromones.decay_factor = 0.0;
    config.pheromones.gain_factor = 0.5;
    config.pheromones.fuzz_factor = 0.0;
    config.ants.move_right_chance = 1.0;
    config.ants.use_pheromone = 2.0;
    config.ants.kill_not_useful = 10_000;
    config
}

fn build_world(image: &SeedImage, config: SimConfig) -> World {
    World::from_seed(
        image,
        zeros(image.width(), image.height()),
        config,
        WorldOptions::default(),
    )
    .expect("world")
}

fn set_preferred(world: &mut World, direction: Vec2) {
    for colony in world.colonies_mut() {
        for ant in &mut colony.ants {
            ant.preferred_dir = direction;
        }
    }
}

#[test]
fn minimal_decay_scenario() {
    let mut image = SeedImage::solid(4, 4, COLOUR_EMPTY);
    image.set(2, 2, COLONY_RED);
    let mut config = base_config();
    config.pheromones.decay_factor = 0.1;
    let mut world = build_world(&image, config);
    set_preferred(&mut world, Vec2::new(1, 0));

    // tick 1: the ant walks its preferred direction and deposits on arrival.
    // A foodless world reports the all-eaten halt straight away; the engine
    // itself keeps stepping, which is what this scenario inspects.
    let outcome = world.step();
    assert_eq!(outcome.halt, Some(HaltReason::AllFoodEaten));
    let ant = &world.colonies()[0].ants[0];
    assert_eq!(ant.pos, Vec2::new(3, 2));
    let deposited = world.pheromones().read(3, 2, 0);
    assert!((deposited.to_colony - 0.5).abs() < 1e-12);
    assert_eq!(deposited.to_food, 0.0);

    // tick 2, phase by phase: the decay commit is what the ants observe
    let seed = world.draw_tick_seed();
    world.decay_pheromones();
    let decayed = world.pheromones().read(3, 2, 0);
    assert!((decayed.to_colony - 0.4).abs() < 1e-12);

    // the ant is at the east edge now, so it bounces in place and deposits
    // again on top of the decayed value
    let reinforce = world.update_colonies(None, seed);
    world.apply_reinforcement(&reinforce, seed, None);
    world.finish_tick();
    let ant = &world.colonies()[0].ants[0];
    assert_eq!(ant.pos, Vec2::new(3, 2));
    assert_eq!(ant.preferred_dir, Vec2::new(-1, 0));
    let redeposited = world.pheromones().read(3, 2, 0);
    assert!((redeposited.to_colony - 0.9).abs() < 1e-12);
}

#[test]
fn obstacle_bounce_scenario() {
    let mut image = SeedImage::solid(3, 3, COLOUR_EMPTY);
    for y in 0..3 {
        image.set(2, y, COLOUR_OBSTACLE);
    }
    image.set(0, 1, COLONY_RED);
    let mut world = build_world(&image, base_config());
    set_preferred(&mut world, Vec2::new(1, 0));

    let expectations = [
        (Vec2::new(1, 1), Vec2::new(1, 0)),
        (Vec2::new(1, 1), Vec2::new(-1, 0)),
        (Vec2::new(0, 1), Vec2::new(-1, 0)),
        (Vec2::new(0, 1), Vec2::new(1, 0)),
    ];
    for (tick, (pos, preferred)) in expectations.into_iter().enumerate() {
        world.step();
        let ant = &world.colonies()[0].ants[0];
        assert_eq!(ant.pos, pos, "position after tick {}", tick + 1);
        assert_eq!(
            ant.preferred_dir,
            preferred,
            "preferred direction after tick {}",
            tick + 1
        );
    }
}

#[test]
fn food_pickup_and_return_scenario() {
    let mut image = SeedImage::solid(5, 5, COLOUR_EMPTY);
    image.set(0, 0, COLONY_RED);
    image.set(2, 0, COLOUR_FOOD);
    let mut config = base_config();
    config.colony.hunger_drain = 0.01;
    config.colony.hunger_replenish = 0.3;
    let mut world = build_world(&image, config);
    set_preferred(&mut world, Vec2::new(1, 0));

    world.step();
    assert_eq!(world.colonies()[0].ants[0].pos, Vec2::new(1, 0));

    world.step();
    {
        let ant = &world.colonies()[0].ants[0];
        assert!(ant.holding_food, "picked up at tick 2");
        assert_eq!(ant.pos, Vec2::new(2, 0));
        assert_eq!(ant.preferred_dir, Vec2::new(-1, 0));
        assert!(!world.food().read(2, 0), "food cell cleared");
    }

    world.step();
    assert_eq!(world.colonies()[0].ants[0].pos, Vec2::new(1, 0));

    world.step();
    let colony = &world.colonies()[0];
    let ant = &colony.ants[0];
    assert_eq!(ant.pos, Vec2::new(0, 0));
    assert!(!ant.holding_food, "dropped at home");
    assert_eq!(colony.ants.len(), 3, "returner triggered one spawn batch");
    // 1.0 - 4 * 0.01 + 0.3 clamps back to 1.0
    assert!((colony.hunger - 1.0).abs() < 1e-12);
}

#[test]
fn starvation_scenario() {
    let mut image = SeedImage::solid(3, 3, COLOUR_EMPTY);
    image.set(1, 1, COLONY_RED);
    let mut config = base_config();
    config.ants.kill_not_useful = 1;
    let mut world = build_world(&image, config);
    set_preferred(&mut world, Vec2::new(0, 1));

    let mut death_tick = None;
    for tick in 1..=80u32 {
        let outcome = world.step();
        if outcome.alive_ants == 0 {
            death_tick = Some(tick);
            assert_eq!(outcome.halt, Some(HaltReason::AllAntsDead));
            break;
        }
    }
    let tick = death_tick.expect("the ant must starve");
    assert!(tick <= 77, "starvation noise window exceeded at tick {tick}");
    assert!(world.colonies()[0].ants[0].dead);
    assert!(
        world.colonies()[0].dead,
        "colony dies once its last ant is gone"
    );
}

#[test]
fn all_food_eaten_halts_the_run() {
    let mut image = SeedImage::solid(3, 3, COLOUR_EMPTY);
    image.set(0, 0, COLONY_RED);
    image.set(2, 2, COLOUR_FOOD);
    let mut config = base_config();
    config.colony.hunger_drain = 0.01;
    config.colony.hunger_replenish = 0.3;
    let mut world = build_world(&image, config);
    set_preferred(&mut world, Vec2::new(1, 1));

    let first = world.step();
    assert!(first.halt.is_none());
    assert_eq!(first.food_remaining, 1);

    let second = world.step();
    assert_eq!(second.halt, Some(HaltReason::AllFoodEaten));
    assert_eq!(second.food_remaining, 0);
    assert!(world.colonies()[0].ants[0].holding_food);
}

#[test]
fn sure_walker_always_moves_by_preferred_direction() {
    let mut image = SeedImage::solid(9, 9, COLOUR_EMPTY);
    image.set(0, 4, COLONY_RED);
    let mut config = base_config();
    config.ants.use_pheromone = f64::INFINITY;
    let mut world = build_world(&image, config);
    set_preferred(&mut world, Vec2::new(1, 0));

    for expected_x in 1..=8 {
        world.step();
        assert_eq!(
            world.colonies()[0].ants[0].pos,
            Vec2::new(expected_x, 4),
            "unobstructed walk is exactly the preferred direction"
        );
    }
}

#[test]
fn hemmed_in_ant_falls_back_to_random_movement() {
    // all eight neighbours blocked: sensing returns the sentinel and the
    // random walk takes over, which at move_right_chance = 1 is the
    // preferred direction straight into a bounce
    let mut image = SeedImage::solid(5, 5, COLOUR_EMPTY);
    image.set(2, 2, COLONY_RED);
    for direction in formicary_core::DIRECTIONS {
        image.set(2 + direction.x, 2 + direction.y, COLOUR_OBSTACLE);
    }
    let mut config = base_config();
    config.ants.use_pheromone = -10_000.0;
    let mut world = build_world(&image, config);
    set_preferred(&mut world, Vec2::new(1, 0));

    world.step();
    let ant = &world.colonies()[0].ants[0];
    assert_eq!(ant.pos, Vec2::new(2, 2), "deadlocked ants stay put");
    assert_eq!(ant.preferred_dir, Vec2::new(-1, 0), "bounced in place");
}

#[test]
fn ant_follows_a_pheromone_gradient_over_its_preferred_direction() {
    let mut image = SeedImage::solid(7, 1, COLOUR_EMPTY);
    image.set(0, 0, COLONY_RED);
    let mut config = base_config();
    config.ants.use_pheromone = 0.05;
    let mut world = build_world(&image, config);
    // preferred direction points the wrong way; the gradient must win
    set_preferred(&mut world, Vec2::new(-1, 0));

    for x in 0..7 {
        world
            .pheromones_mut()
            .write(x, 0, 0, formicary_core::PheromoneStrength::new(0.0, 0.1 * f64::from(x + 1)));
    }
    world.pheromones_mut().commit();

    for expected_x in 1..=5 {
        world.step();
        let ant = &world.colonies()[0].ants[0];
        assert_eq!(
            ant.pos,
            Vec2::new(expected_x, 0),
            "ant must climb the to-food gradient"
        );
        assert_eq!(
            ant.preferred_dir,
            Vec2::new(-1, 0),
            "gradient following leaves the preferred direction alone"
        );
    }
}

#[test]
fn ants_never_leave_the_grid_or_enter_obstacles() {
    let mut image = SeedImage::solid(8, 8, COLOUR_EMPTY);
    image.set(1, 1, COLONY_RED);
    image.set(6, 6, Rgb::new(30, 30, 200));
    for y in 2..6 {
        image.set(4, y, COLOUR_OBSTACLE);
    }
    image.set(6, 1, COLOUR_FOOD);
    image.set(1, 6, COLOUR_FOOD);
    let mut config = base_config();
    config.colony.starting_ants = 6;
    config.ants.move_right_chance = 0.4;
    config.ants.use_pheromone = 0.1;
    config.pheromones.decay_factor = 0.05;
    let mut world = build_world(&image, config);

    for _ in 0..60 {
        world.step();
        for colony in world.colonies() {
            for ant in &colony.ants {
                assert!(ant.pos.x >= 0 && ant.pos.x < 8);
                assert!(ant.pos.y >= 0 && ant.pos.y < 8);
                assert!(
                    !world.obstacles().read(ant.pos.x, ant.pos.y),
                    "ant stood on an obstacle at {}",
                    ant.pos
                );
            }
        }
    }
}

#[test]
fn pheromone_channels_stay_in_unit_range() {
    let mut image = SeedImage::solid(6, 6, COLOUR_EMPTY);
    image.set(2, 2, COLONY_RED);
    image.set(5, 5, COLOUR_FOOD);
    let mut config = base_config();
    config.colony.starting_ants = 5;
    config.pheromones.decay_factor = 0.02;
    config.pheromones.gain_factor = 0.9;
    config.pheromones.fuzz_factor = 2.0;
    config.ants.move_right_chance = 0.3;
    let buffer: Vec<f64> = (0..36).map(|i| ((i * 7) % 36) as f64 / 18.0 - 1.0).collect();
    let mut world =
        World::from_seed(&image, buffer, config, WorldOptions::default()).expect("world");

    for _ in 0..40 {
        world.step();
        for cell in world.pheromones().clean_cells() {
            assert!((0.0..=1.0).contains(&cell.to_colony));
            assert!((0.0..=1.0).contains(&cell.to_food));
        }
        for colony in world.colonies() {
            assert!((0.0..=1.0).contains(&colony.hunger));
        }
    }
}
