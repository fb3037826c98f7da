//! Core types and tick engine shared across the Formicary workspace.
//!
//! A world holds three snapshot grids (food, obstacles, per-colony pheromones),
//! a colony list and the RNG service. Each tick runs four strict phases:
//! pheromone decay, the parallel ant update, serial colony bookkeeping, and the
//! commit + termination decision. Readers always see the committed (clean) half
//! of every grid, so the schedule of the parallel phase cannot leak into the
//! observable outcome.

use rand::{Rng, SeedableRng};
use rand_pcg::{Pcg32, Pcg64Mcg};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// High level simulation clock (ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Integer grid position or offset.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Vec2 {
    pub x: i32,
    pub y: i32,
}

impl Vec2 {
    /// Construct a new vector.
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Chebyshev distance to `other`; the natural metric on an 8-connected grid.
    #[must_use]
    pub fn chebyshev(self, other: Self) -> i32 {
        (other.x - self.x).abs().max((other.y - self.y).abs())
    }

    /// The vector pointing the opposite way (used when an ant bounces).
    #[must_use]
    pub const fn inverted(self) -> Self {
        Self {
            x: -self.x,
            y: -self.y,
        }
    }
}

impl fmt::Display for Vec2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// The 8 neighbour offsets, in the fixed iteration order every sensing and
/// tie-breaking rule relies on.
pub const DIRECTIONS: [Vec2; 8] = [
    Vec2::new(-1, -1),
    Vec2::new(-1, 0),
    Vec2::new(-1, 1),
    Vec2::new(0, -1),
    Vec2::new(0, 1),
    Vec2::new(1, -1),
    Vec2::new(1, 0),
    Vec2::new(1, 1),
];

/// 8-bit RGB colour; doubles as colony identity in the seed image.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    /// Construct a new colour.
    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Channel-wise multiplicative attenuation, rounded to 8 bits.
    #[must_use]
    pub fn scaled(self, factor: f64) -> Self {
        let scale = |channel: u8| (f64::from(channel) * factor).round() as u8;
        Self {
            r: scale(self.r),
            g: scale(self.g),
            b: scale(self.b),
        }
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.r, self.g, self.b)
    }
}

/// Seed-image colour marking an empty cell.
pub const COLOUR_EMPTY: Rgb = Rgb::new(0, 0, 0);
/// Seed-image colour marking a food cell.
pub const COLOUR_FOOD: Rgb = Rgb::new(0, 255, 0);
/// Seed-image colour marking an obstacle cell.
pub const COLOUR_OBSTACLE: Rgb = Rgb::new(128, 128, 128);

/// Per-cell, per-colony pheromone channels, each kept in `[0, 1]` across commits.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PheromoneStrength {
    pub to_colony: f64,
    pub to_food: f64,
}

impl PheromoneStrength {
    /// Construct a new pheromone cell.
    #[must_use]
    pub const fn new(to_colony: f64, to_food: f64) -> Self {
        Self { to_colony, to_food }
    }
}

/// Cell types that can feed a CRC32 digest of a grid buffer.
pub trait CrcCell {
    fn crc_feed(&self, hasher: &mut crc32fast::Hasher);
}

impl CrcCell for bool {
    fn crc_feed(&self, hasher: &mut crc32fast::Hasher) {
        hasher.update(&[u8::from(*self)]);
    }
}

impl CrcCell for f64 {
    fn crc_feed(&self, hasher: &mut crc32fast::Hasher) {
        hasher.update(&self.to_le_bytes());
    }
}

impl CrcCell for PheromoneStrength {
    fn crc_feed(&self, hasher: &mut crc32fast::Hasher) {
        self.to_colony.crc_feed(hasher);
        self.to_food.crc_feed(hasher);
    }
}

fn crc32_of<T: CrcCell>(cells: &[T]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for cell in cells {
        cell.crc_feed(&mut hasher);
    }
    hasher.finalize()
}

/// Double-buffered 2D field. Reads are served from the clean buffer, writes
/// accumulate in the dirty buffer, and `commit` publishes dirty as the new
/// clean state. An optional `written` mask records which cells were written
/// through [`SnapGrid2D::write`] since the last commit; the distributed driver
/// merges on it.
#[derive(Debug, Clone)]
pub struct SnapGrid2D<T> {
    width: i32,
    height: i32,
    clean: Vec<T>,
    dirty: Vec<T>,
    written: Vec<bool>,
}

impl<T: Copy + Default> SnapGrid2D<T> {
    /// Construct an all-default grid without write tracking.
    #[must_use]
    pub fn new(width: i32, height: i32) -> Self {
        Self::build(width, height, false)
    }

    /// Construct an all-default grid that tracks per-cell writes.
    #[must_use]
    pub fn tracked(width: i32, height: i32) -> Self {
        Self::build(width, height, true)
    }

    fn build(width: i32, height: i32, tracked: bool) -> Self {
        debug_assert!(width > 0 && height > 0);
        let cells = (width as usize) * (height as usize);
        Self {
            width,
            height,
            clean: vec![T::default(); cells],
            dirty: vec![T::default(); cells],
            written: if tracked { vec![false; cells] } else { Vec::new() },
        }
    }

    #[must_use]
    pub const fn width(&self) -> i32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> i32 {
        self.height
    }

    #[inline]
    fn offset(&self, x: i32, y: i32) -> usize {
        debug_assert!(x >= 0 && x < self.width && y >= 0 && y < self.height);
        (x + self.width * y) as usize
    }

    /// Read a cell from the clean buffer.
    #[inline]
    #[must_use]
    pub fn read(&self, x: i32, y: i32) -> T {
        self.clean[self.offset(x, y)]
    }

    /// Write a cell into the dirty buffer, marking it when tracking is on.
    #[inline]
    pub fn write(&mut self, x: i32, y: i32, value: T) {
        let index = self.offset(x, y);
        self.dirty[index] = value;
        if !self.written.is_empty() {
            self.written[index] = true;
        }
    }

    /// Publish the dirty buffer as the new clean state and reset the mask.
    pub fn commit(&mut self) {
        self.clean.copy_from_slice(&self.dirty);
        self.written.fill(false);
    }

    /// Immutable view of the clean buffer.
    #[must_use]
    pub fn clean_cells(&self) -> &[T] {
        &self.clean
    }

    /// Immutable view of the dirty buffer.
    #[must_use]
    pub fn dirty_cells(&self) -> &[T] {
        &self.dirty
    }

    /// Mutable view of the dirty buffer. Bypasses the written mask; reserved
    /// for phases that are replicated identically on every participant.
    #[must_use]
    pub fn dirty_cells_mut(&mut self) -> &mut [T] {
        &mut self.dirty
    }

    /// The per-cell written mask; empty when tracking is off.
    #[must_use]
    pub fn written_cells(&self) -> &[bool] {
        &self.written
    }

    /// Whether this grid records per-cell writes.
    #[must_use]
    pub fn is_tracked(&self) -> bool {
        !self.written.is_empty()
    }
}

impl<T: Copy + Default + CrcCell> SnapGrid2D<T> {
    /// CRC32 digest of the clean buffer, for verification.
    #[must_use]
    pub fn crc32_clean(&self) -> u32 {
        crc32_of(&self.clean)
    }

    /// CRC32 digest of the dirty buffer, for verification.
    #[must_use]
    pub fn crc32_dirty(&self) -> u32 {
        crc32_of(&self.dirty)
    }
}

/// Double-buffered 3D field with the same read/write/commit contract as
/// [`SnapGrid2D`]; the flat index is `x + width * y + width * height * z`.
#[derive(Debug, Clone)]
pub struct SnapGrid3D<T> {
    width: i32,
    height: i32,
    depth: i32,
    clean: Vec<T>,
    dirty: Vec<T>,
    written: Vec<bool>,
}

impl<T: Copy + Default> SnapGrid3D<T> {
    /// Construct an all-default grid without write tracking.
    #[must_use]
    pub fn new(width: i32, height: i32, depth: i32) -> Self {
        Self::build(width, height, depth, false)
    }

    /// Construct an all-default grid that tracks per-cell writes.
    #[must_use]
    pub fn tracked(width: i32, height: i32, depth: i32) -> Self {
        Self::build(width, height, depth, true)
    }

    fn build(width: i32, height: i32, depth: i32, tracked: bool) -> Self {
        debug_assert!(width > 0 && height > 0 && depth >= 0);
        let cells = (width as usize) * (height as usize) * (depth as usize);
        Self {
            width,
            height,
            depth,
            clean: vec![T::default(); cells],
            dirty: vec![T::default(); cells],
            written: if tracked { vec![false; cells] } else { Vec::new() },
        }
    }

    #[must_use]
    pub const fn width(&self) -> i32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> i32 {
        self.height
    }

    #[must_use]
    pub const fn depth(&self) -> i32 {
        self.depth
    }

    #[inline]
    fn offset(&self, x: i32, y: i32, z: i32) -> usize {
        debug_assert!(x >= 0 && x < self.width && y >= 0 && y < self.height);
        debug_assert!(z >= 0 && z < self.depth);
        (x + self.width * y + self.width * self.height * z) as usize
    }

    /// Read a cell from the clean buffer.
    #[inline]
    #[must_use]
    pub fn read(&self, x: i32, y: i32, z: i32) -> T {
        self.clean[self.offset(x, y, z)]
    }

    /// Write a cell into the dirty buffer, marking it when tracking is on.
    #[inline]
    pub fn write(&mut self, x: i32, y: i32, z: i32, value: T) {
        let index = self.offset(x, y, z);
        self.dirty[index] = value;
        if !self.written.is_empty() {
            self.written[index] = true;
        }
    }

    /// Publish the dirty buffer as the new clean state and reset the mask.
    pub fn commit(&mut self) {
        self.clean.copy_from_slice(&self.dirty);
        self.written.fill(false);
    }

    /// Immutable view of the clean buffer.
    #[must_use]
    pub fn clean_cells(&self) -> &[T] {
        &self.clean
    }

    /// Immutable view of the dirty buffer.
    #[must_use]
    pub fn dirty_cells(&self) -> &[T] {
        &self.dirty
    }

    /// Mutable view of the dirty buffer. Bypasses the written mask; reserved
    /// for phases that are replicated identically on every participant.
    #[must_use]
    pub fn dirty_cells_mut(&mut self) -> &mut [T] {
        &mut self.dirty
    }

    /// Simultaneous clean/dirty views for the bulk decay pass.
    #[must_use]
    pub fn split_buffers(&mut self) -> (&[T], &mut [T]) {
        (&self.clean, &mut self.dirty)
    }

    /// The per-cell written mask; empty when tracking is off.
    #[must_use]
    pub fn written_cells(&self) -> &[bool] {
        &self.written
    }

    /// Whether this grid records per-cell writes.
    #[must_use]
    pub fn is_tracked(&self) -> bool {
        !self.written.is_empty()
    }
}

impl<T: Copy + Default + CrcCell> SnapGrid3D<T> {
    /// CRC32 digest of the clean buffer, for verification.
    #[must_use]
    pub fn crc32_clean(&self) -> u32 {
        crc32_of(&self.clean)
    }

    /// CRC32 digest of the dirty buffer, for verification.
    #[must_use]
    pub fn crc32_dirty(&self) -> u32 {
        crc32_of(&self.dirty)
    }
}

/// A single ant. Dead ants stay in their colony's vector with `dead` set so
/// indices remain stable for the whole tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ant {
    pub id: u64,
    pub pos: Vec2,
    pub holding_food: bool,
    pub preferred_dir: Vec2,
    pub ticks_since_useful: i32,
    pub visited: HashSet<Vec2>,
    pub dead: bool,
}

impl Ant {
    /// A freshly spawned ant at its colony position.
    #[must_use]
    pub fn spawned(id: u64, pos: Vec2, preferred_dir: Vec2) -> Self {
        Self {
            id,
            pos,
            holding_food: false,
            preferred_dir,
            ticks_since_useful: 0,
            visited: HashSet::new(),
            dead: false,
        }
    }
}

/// A colony: identity, colour, home position, hunger meter and its ants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Colony {
    pub id: u32,
    pub colour: Rgb,
    pub pos: Vec2,
    pub hunger: f64,
    pub ants: Vec<Ant>,
    pub dead: bool,
}

impl Colony {
    /// Number of ants that have not died.
    #[must_use]
    pub fn alive_ants(&self) -> usize {
        self.ants.iter().filter(|ant| !ant.dead).count()
    }
}

/// `[simulation]` section of the configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationSettings {
    /// Input raster encoding obstacles, food and colony seeds.
    pub grid_file: String,
    /// Pre-generated random resource consumed by the decay phase.
    pub random_file: String,
    /// 0 selects a nanosecond wall-clock seed; anything else is used literally.
    pub rng_seed: i64,
    /// Upper bound on simulated ticks.
    pub simulate_ticks: u32,
    /// Emit frames and statistics into the output archive.
    pub recording_enabled: bool,
    /// Prefix of the archive filename.
    pub output_prefix: String,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            grid_file: "world.png".to_string(),
            random_file: "random.bin".to_string(),
            rng_seed: 0,
            simulate_ticks: 1_000,
            recording_enabled: true,
            output_prefix: String::new(),
        }
    }
}

/// `[colony]` section of the configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ColonySettings {
    /// Ants seeded into each colony at start.
    pub starting_ants: u32,
    /// Ants spawned per reinforcement.
    pub ants_per_tick: u32,
    /// Hunger subtracted each tick.
    pub hunger_drain: f64,
    /// Hunger added when an ant returns with food.
    pub hunger_replenish: f64,
    /// Chebyshev radius counted as "home".
    pub return_distance: i32,
}

impl Default for ColonySettings {
    fn default() -> Self {
        Self {
            starting_ants: 25,
            ants_per_tick: 10,
            hunger_drain: 0.001,
            hunger_replenish: 0.1,
            return_distance: 3,
        }
    }
}

/// `[pheromones]` section of the configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PheromoneSettings {
    /// Strength subtracted from both channels each tick.
    pub decay_factor: f64,
    /// Strength added per ant deposit.
    pub gain_factor: f64,
    /// Multiplier on the decay noise; 0 disables the fuzz entirely.
    pub fuzz_factor: f64,
}

impl Default for PheromoneSettings {
    fn default() -> Self {
        Self {
            decay_factor: 0.02,
            gain_factor: 0.1,
            fuzz_factor: 0.1,
        }
    }
}

/// `[ants]` section of the configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AntSettings {
    /// Probability of following the preferred direction when walking randomly.
    pub move_right_chance: f64,
    /// Minimum sensed strength before an ant follows the pheromone gradient.
    pub use_pheromone: f64,
    /// Base number of useless ticks before an ant starves.
    pub kill_not_useful: i32,
}

impl Default for AntSettings {
    fn default() -> Self {
        Self {
            move_right_chance: 0.8,
            use_pheromone: 0.075,
            kill_not_useful: 400,
        }
    }
}

/// `[render]` section of the configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderSettings {
    /// Half the side of the solid square painted over each colony.
    pub colony_half_size: i32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self { colony_half_size: 2 }
    }
}

/// Full configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimConfig {
    pub simulation: SimulationSettings,
    pub colony: ColonySettings,
    pub pheromones: PheromoneSettings,
    pub ants: AntSettings,
    pub render: RenderSettings,
}

impl SimConfig {
    /// Reject configurations the engine cannot run.
    pub fn validate(&self) -> Result<(), WorldError> {
        if self.simulation.simulate_ticks == 0 {
            return Err(WorldError::InvalidConfig("simulate_ticks must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.ants.move_right_chance) {
            return Err(WorldError::InvalidConfig(
                "move_right_chance must lie in [0, 1]",
            ));
        }
        if self.pheromones.decay_factor < 0.0 || !self.pheromones.decay_factor.is_finite() {
            return Err(WorldError::InvalidConfig(
                "decay_factor must be finite and non-negative",
            ));
        }
        if self.pheromones.gain_factor < 0.0 || !self.pheromones.gain_factor.is_finite() {
            return Err(WorldError::InvalidConfig(
                "gain_factor must be finite and non-negative",
            ));
        }
        if !self.pheromones.fuzz_factor.is_finite() {
            return Err(WorldError::InvalidConfig("fuzz_factor must be finite"));
        }
        if self.ants.use_pheromone.is_nan() {
            return Err(WorldError::InvalidConfig("use_pheromone must not be NaN"));
        }
        if self.colony.hunger_drain < 0.0
            || self.colony.hunger_replenish < 0.0
            || self.colony.return_distance < 0
            || self.ants.kill_not_useful < 0
            || self.render.colony_half_size < 0
        {
            return Err(WorldError::InvalidConfig(
                "colony, starvation and render parameters must be non-negative",
            ));
        }
        Ok(())
    }
}

/// Errors raised while constructing or partitioning world state.
#[derive(Debug, Error, PartialEq)]
pub enum WorldError {
    /// A configuration value the engine cannot run with.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The seed raster does not describe a usable grid.
    #[error("invalid seed image: {0}")]
    InvalidSeedImage(&'static str),
    /// The external random resource is shorter than the grid needs.
    #[error("random resource holds {actual} values but the grid needs {expected}")]
    RandomBufferTooSmall { expected: usize, actual: usize },
    /// Colony count must divide evenly across distributed participants.
    #[error("{colonies} colonies cannot be split evenly across {participants} participants")]
    UnevenColonySplit {
        colonies: usize,
        participants: usize,
    },
}

/// Decoded seed raster: row-major RGB pixels.
#[derive(Debug, Clone)]
pub struct SeedImage {
    width: i32,
    height: i32,
    pixels: Vec<Rgb>,
}

impl SeedImage {
    /// Wrap decoded pixels; the vector must hold exactly `width * height` entries.
    pub fn new(width: i32, height: i32, pixels: Vec<Rgb>) -> Result<Self, WorldError> {
        if width <= 0 || height <= 0 {
            return Err(WorldError::InvalidSeedImage(
                "image dimensions must be positive",
            ));
        }
        if pixels.len() != (width as usize) * (height as usize) {
            return Err(WorldError::InvalidSeedImage(
                "pixel count does not match image dimensions",
            ));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// An image filled with a single colour, for tests and tooling.
    #[must_use]
    pub fn solid(width: i32, height: i32, colour: Rgb) -> Self {
        Self {
            width,
            height,
            pixels: vec![colour; (width as usize) * (height as usize)],
        }
    }

    /// Overwrite one pixel.
    pub fn set(&mut self, x: i32, y: i32, colour: Rgb) {
        let index = (x + self.width * y) as usize;
        self.pixels[index] = colour;
    }

    #[must_use]
    pub const fn width(&self) -> i32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> i32 {
        self.height
    }

    #[must_use]
    pub fn pixel(&self, x: i32, y: i32) -> Rgb {
        self.pixels[(x + self.width * y) as usize]
    }
}

/// Why the simulation decided to stop early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    AllAntsDead,
    AllFoodEaten,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllAntsDead => f.write_str("all ants have died"),
            Self::AllFoodEaten => f.write_str("all food has been eaten"),
        }
    }
}

/// Summary emitted after each tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickOutcome {
    pub tick: Tick,
    pub alive_ants: usize,
    pub food_remaining: usize,
    pub halt: Option<HaltReason>,
}

/// Knobs that differ between the single-process and distributed builds of a world.
#[derive(Debug, Clone, Copy)]
pub struct WorldOptions {
    /// Record per-cell writes so the distributed driver can merge them.
    pub track_writes: bool,
    /// High bits of every ant id minted by this participant.
    pub ant_id_base: u64,
}

impl Default for WorldOptions {
    fn default() -> Self {
        Self {
            track_writes: false,
            ant_id_base: 0,
        }
    }
}

impl WorldOptions {
    /// Options for a distributed participant; the rank partitions the ant id space.
    #[must_use]
    pub fn for_rank(rank: u32) -> Self {
        Self {
            track_writes: true,
            ant_id_base: u64::from(rank) << 48,
        }
    }
}

/// Sentinel strength returned when no neighbour is eligible during sensing.
pub const NO_PHEROMONE: f64 = (i32::MIN + 1) as f64;

const SPAWN_STREAM: u64 = 1 << 32;

/// Fields an ant update needs from the world, all of them clean-buffer reads.
struct AntContext<'a> {
    width: i32,
    height: i32,
    food: &'a SnapGrid2D<bool>,
    obstacles: &'a SnapGrid2D<bool>,
    pheromones: &'a SnapGrid3D<PheromoneStrength>,
    move_right_chance: f64,
    use_pheromone: f64,
    gain_factor: f64,
    kill_not_useful: i32,
    return_distance: i32,
}

/// Dirty writes one colony produced during the parallel phase; applied
/// serially in ascending colony order, which realises the serialised write
/// paths deterministically.
#[derive(Debug, Default)]
struct ColonyOutcome {
    pheromone_writes: Vec<(Vec2, PheromoneStrength)>,
    food_clears: Vec<Vec2>,
    reinforce: bool,
}

/// Aggregate world state: grids, colonies, counters and the RNG service.
pub struct World {
    width: i32,
    height: i32,
    food: SnapGrid2D<bool>,
    obstacles: SnapGrid2D<bool>,
    pheromones: SnapGrid3D<PheromoneStrength>,
    colonies: Vec<Colony>,
    rng: Pcg64Mcg,
    rng_seed: u64,
    random_buffer: Vec<f64>,
    next_ant_id: u64,
    max_ants_alive: usize,
    max_ants_last_tick: usize,
    tick: Tick,
    config: SimConfig,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("tick", &self.tick)
            .field("colonies", &self.colonies.len())
            .field("rng_seed", &self.rng_seed)
            .finish()
    }
}

impl World {
    /// Build a world from a decoded seed raster, the external random resource
    /// and a validated configuration.
    ///
    /// Pixels are classified by exact RGB match: black is empty, pure green is
    /// food, mid grey is an obstacle, and every other colour seeds a colony at
    /// its first occurrence in row-major order. Colony ids are assigned in
    /// that same order.
    pub fn from_seed(
        seed: &SeedImage,
        mut random_buffer: Vec<f64>,
        config: SimConfig,
        options: WorldOptions,
    ) -> Result<Self, WorldError> {
        config.validate()?;
        let width = seed.width();
        let height = seed.height();
        let cell_count = (width as usize) * (height as usize);
        if random_buffer.len() < cell_count {
            return Err(WorldError::RandomBufferTooSmall {
                expected: cell_count,
                actual: random_buffer.len(),
            });
        }
        random_buffer.truncate(cell_count);

        let (mut food, mut obstacles) = if options.track_writes {
            (
                SnapGrid2D::tracked(width, height),
                SnapGrid2D::tracked(width, height),
            )
        } else {
            (SnapGrid2D::new(width, height), SnapGrid2D::new(width, height))
        };

        let mut seen = HashMap::new();
        let mut colony_seeds: Vec<(Rgb, Vec2)> = Vec::new();
        for y in 0..height {
            for x in 0..width {
                let pixel = seed.pixel(x, y);
                if pixel == COLOUR_EMPTY {
                    continue;
                } else if pixel == COLOUR_FOOD {
                    food.write(x, y, true);
                } else if pixel == COLOUR_OBSTACLE {
                    obstacles.write(x, y, true);
                } else if seen.insert(pixel, ()).is_none() {
                    // first occurrence wins
                    colony_seeds.push((pixel, Vec2::new(x, y)));
                }
            }
        }
        food.commit();
        obstacles.commit();

        let rng_seed = resolve_seed(config.simulation.rng_seed);
        let mut rng = Pcg64Mcg::seed_from_u64(rng_seed);

        let mut next_ant_id = options.ant_id_base;
        let mut colonies = Vec::with_capacity(colony_seeds.len());
        for (index, (colour, pos)) in colony_seeds.into_iter().enumerate() {
            let mut ants = Vec::with_capacity(config.colony.starting_ants as usize);
            for _ in 0..config.colony.starting_ants {
                let preferred = DIRECTIONS[rng.random_range(0..DIRECTIONS.len())];
                ants.push(Ant::spawned(next_ant_id, pos, preferred));
                next_ant_id += 1;
            }
            colonies.push(Colony {
                id: index as u32,
                colour,
                pos,
                hunger: 1.0,
                ants,
                dead: false,
            });
        }

        let pheromones = if options.track_writes {
            SnapGrid3D::tracked(width, height, colonies.len() as i32)
        } else {
            SnapGrid3D::new(width, height, colonies.len() as i32)
        };

        Ok(Self {
            width,
            height,
            food,
            obstacles,
            pheromones,
            colonies,
            rng,
            rng_seed,
            random_buffer,
            next_ant_id,
            max_ants_alive: 0,
            max_ants_last_tick: 0,
            tick: Tick::zero(),
            config,
        })
    }

    /// Run one full single-process tick: decay, ant update, bookkeeping,
    /// commit and the termination decision.
    pub fn step(&mut self) -> TickOutcome {
        let seed = self.draw_tick_seed();
        self.decay_pheromones();
        let reinforce = self.update_colonies(None, seed);
        self.apply_reinforcement(&reinforce, seed, None);
        self.finish_tick()
    }

    /// Draw the shared per-tick seed from the world RNG. Every derived RNG in
    /// the tick is keyed on this value alone, which is what makes the outcome
    /// independent of thread count.
    pub fn draw_tick_seed(&mut self) -> u64 {
        self.rng.random()
    }

    /// Decay both pheromone channels of every live colony's layer, optionally
    /// fuzzed by the pre-generated random resource, then force a commit so the
    /// ant phase observes the decayed field.
    pub fn decay_pheromones(&mut self) {
        let decay = self.config.pheromones.decay_factor;
        let fuzz = self.config.pheromones.fuzz_factor * decay;
        let width = self.width as usize;
        let height = self.height as usize;
        let plane = width * height;
        let alive: Vec<bool> = self.colonies.iter().map(|colony| !colony.dead).collect();
        let buffer = &self.random_buffer;
        let (clean, dirty) = self.pheromones.split_buffers();

        dirty
            .par_chunks_mut(width)
            .zip(clean.par_chunks(width))
            .enumerate()
            .for_each(|(row, (dirty_row, clean_row))| {
                let z = row / height;
                if !alive[z] {
                    return;
                }
                let y = row % height;
                for x in 0..width {
                    let mut cell = clean_row[x];
                    if fuzz.abs() >= 1e-4 {
                        // one draw shared by both channels of the cell
                        let noise = buffer[(x + width * y + plane * z) % buffer.len()] * fuzz;
                        cell.to_colony -= decay + noise;
                        cell.to_food -= decay + noise;
                    } else {
                        cell.to_colony -= decay;
                        cell.to_food -= decay;
                    }
                    cell.to_colony = cell.to_colony.clamp(0.0, 1.0);
                    cell.to_food = cell.to_food.clamp(0.0, 1.0);
                    dirty_row[x] = cell;
                }
            });

        self.pheromones.commit();
    }

    /// Run the parallel ant update over the selected colonies (all of them
    /// when `only` is `None`) and apply the collected dirty writes in
    /// ascending colony order. Returns the per-colony reinforcement flags.
    pub fn update_colonies(&mut self, only: Option<&[usize]>, seed: u64) -> Vec<bool> {
        let colony_count = self.colonies.len();
        let mask = selection_mask(colony_count, only);
        let ctx = AntContext {
            width: self.width,
            height: self.height,
            food: &self.food,
            obstacles: &self.obstacles,
            pheromones: &self.pheromones,
            move_right_chance: self.config.ants.move_right_chance,
            use_pheromone: self.config.ants.use_pheromone,
            gain_factor: self.config.pheromones.gain_factor,
            kill_not_useful: self.config.ants.kill_not_useful,
            return_distance: self.config.colony.return_distance,
        };

        let outcomes: Vec<Option<ColonyOutcome>> = self
            .colonies
            .par_iter_mut()
            .enumerate()
            .map(|(index, colony)| {
                if !mask[index] || colony.dead {
                    return None;
                }
                let mut rng = Pcg32::new(seed, u64::from(colony.id));
                Some(update_colony(&ctx, colony, &mut rng))
            })
            .collect();

        let mut reinforce = vec![false; colony_count];
        for (index, outcome) in outcomes.into_iter().enumerate() {
            let Some(outcome) = outcome else { continue };
            for (pos, value) in outcome.pheromone_writes {
                self.pheromones.write(pos.x, pos.y, index as i32, value);
            }
            for pos in outcome.food_clears {
                self.food.write(pos.x, pos.y, false);
            }
            reinforce[index] = outcome.reinforce;
        }
        reinforce
    }

    /// Replenish and spawn for every flagged colony among the selected ones,
    /// in ascending colony order. Spawn directions come from per-colony spawn
    /// streams keyed on the tick seed, so every participant mints identical
    /// ants for identical flags.
    pub fn apply_reinforcement(&mut self, reinforce: &[bool], seed: u64, only: Option<&[usize]>) {
        let mask = selection_mask(self.colonies.len(), only);
        let replenish = self.config.colony.hunger_replenish;
        let per_tick = self.config.colony.ants_per_tick;
        let mut next_id = self.next_ant_id;
        for (index, colony) in self.colonies.iter_mut().enumerate() {
            if !mask[index] || !reinforce.get(index).copied().unwrap_or(false) || colony.dead {
                continue;
            }
            colony.hunger += replenish;
            let mut spawn_rng = Pcg32::new(seed, SPAWN_STREAM + index as u64);
            for _ in 0..per_tick {
                let preferred = DIRECTIONS[spawn_rng.random_range(0..DIRECTIONS.len())];
                colony.ants.push(Ant::spawned(next_id, colony.pos, preferred));
                next_id += 1;
            }
        }
        self.next_ant_id = next_id;
    }

    /// Drain hunger and decide death for the selected colonies, returning the
    /// number of ants alive in colonies that survived.
    pub fn colony_upkeep(&mut self, only: Option<&[usize]>) -> usize {
        let mask = selection_mask(self.colonies.len(), only);
        let drain = self.config.colony.hunger_drain;
        let mut alive_ants = 0;
        for (index, colony) in self.colonies.iter_mut().enumerate() {
            if !mask[index] {
                continue;
            }
            colony.hunger = (colony.hunger - drain).clamp(0.0, 1.0);
            let alive = colony.alive_ants();
            if colony.hunger <= 0.0 || alive == 0 {
                colony.dead = true;
            } else {
                alive_ants += alive;
            }
        }
        alive_ants
    }

    /// Serial end of tick: upkeep over every colony, stats rollup, grid
    /// commits, the food scan and the termination decision.
    pub fn finish_tick(&mut self) -> TickOutcome {
        let alive_ants = self.colony_upkeep(None);
        self.max_ants_last_tick = alive_ants;
        self.max_ants_alive = self.max_ants_alive.max(alive_ants);

        self.food.commit();
        self.pheromones.commit();

        let food_remaining = self.food.clean_cells().iter().filter(|cell| **cell).count();
        self.tick = self.tick.next();

        let halt = if alive_ants == 0 {
            Some(HaltReason::AllAntsDead)
        } else if food_remaining == 0 {
            Some(HaltReason::AllFoodEaten)
        } else {
            None
        };
        TickOutcome {
            tick: self.tick,
            alive_ants,
            food_remaining,
            halt,
        }
    }

    /// Pack the dirty pheromone field as flat `[to_colony, to_food]` pairs in
    /// cell-major, colony-innermost order.
    #[must_use]
    pub fn pack_pheromones(&self) -> Vec<f64> {
        let depth = self.pheromones.depth();
        let mut packed = Vec::with_capacity(
            (self.width as usize) * (self.height as usize) * (depth as usize) * 2,
        );
        let dirty = self.pheromones.dirty_cells();
        let plane = (self.width as usize) * (self.height as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                let cell = (x + self.width * y) as usize;
                for z in 0..depth as usize {
                    let value = dirty[cell + plane * z];
                    packed.push(value.to_colony);
                    packed.push(value.to_food);
                }
            }
        }
        packed
    }

    /// Load a packed pheromone field (the layout of [`World::pack_pheromones`])
    /// into the dirty buffer without touching the written mask.
    pub fn unpack_pheromones(&mut self, packed: &[f64]) {
        let depth = self.pheromones.depth() as usize;
        let plane = (self.width as usize) * (self.height as usize);
        debug_assert_eq!(packed.len(), plane * depth * 2);
        let dirty = self.pheromones.dirty_cells_mut();
        let mut index = 0;
        for cell in 0..plane {
            for z in 0..depth {
                dirty[cell + plane * z] = PheromoneStrength::new(packed[index], packed[index + 1]);
                index += 2;
            }
        }
    }

    #[must_use]
    pub const fn width(&self) -> i32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> i32 {
        self.height
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// The seed the world RNG was initialised with, after wall-clock resolution.
    #[must_use]
    pub const fn rng_seed(&self) -> u64 {
        self.rng_seed
    }

    /// Read-only access to the colony list, in id order.
    #[must_use]
    pub fn colonies(&self) -> &[Colony] {
        &self.colonies
    }

    /// Mutable access to the colony list (distributed merge path).
    #[must_use]
    pub fn colonies_mut(&mut self) -> &mut Vec<Colony> {
        &mut self.colonies
    }

    /// Immutable access to the food grid.
    #[must_use]
    pub fn food(&self) -> &SnapGrid2D<bool> {
        &self.food
    }

    /// Mutable access to the food grid.
    #[must_use]
    pub fn food_mut(&mut self) -> &mut SnapGrid2D<bool> {
        &mut self.food
    }

    /// Immutable access to the obstacle grid (read-only after init).
    #[must_use]
    pub fn obstacles(&self) -> &SnapGrid2D<bool> {
        &self.obstacles
    }

    /// Immutable access to the pheromone grid.
    #[must_use]
    pub fn pheromones(&self) -> &SnapGrid3D<PheromoneStrength> {
        &self.pheromones
    }

    /// Mutable access to the pheromone grid.
    #[must_use]
    pub fn pheromones_mut(&mut self) -> &mut SnapGrid3D<PheromoneStrength> {
        &mut self.pheromones
    }

    /// Highest number of ants ever alive at one tick boundary.
    #[must_use]
    pub const fn max_ants_alive(&self) -> usize {
        self.max_ants_alive
    }

    /// Number of ants alive after the most recent tick.
    #[must_use]
    pub const fn max_ants_last_tick(&self) -> usize {
        self.max_ants_last_tick
    }

    /// Immutable access to the configuration.
    #[must_use]
    pub const fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Colonies that have not died.
    #[must_use]
    pub fn surviving_colonies(&self) -> usize {
        self.colonies.iter().filter(|colony| !colony.dead).count()
    }
}

fn resolve_seed(configured: i64) -> u64 {
    if configured == 0 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or(0x5eed_cafe)
    } else {
        configured as u64
    }
}

fn selection_mask(len: usize, only: Option<&[usize]>) -> Vec<bool> {
    match only {
        None => vec![true; len],
        Some(indices) => {
            let mut mask = vec![false; len];
            for &index in indices {
                if index < len {
                    mask[index] = true;
                }
            }
            mask
        }
    }
}

/// Best neighbour direction for `ant` by the relevant pheromone channel of its
/// colony, skipping out-of-bounds, obstacle and already-visited cells. Ties
/// resolve to the last direction in [`DIRECTIONS`] order. When nothing is
/// eligible the strength is the [`NO_PHEROMONE`] sentinel.
fn strongest_pheromone(ctx: &AntContext<'_>, layer: i32, ant: &Ant) -> (Vec2, f64) {
    let mut best_direction = Vec2::default();
    let mut best_strength = NO_PHEROMONE;

    for direction in DIRECTIONS {
        let x = ant.pos.x + direction.x;
        let y = ant.pos.y + direction.y;
        if x < 0 || y < 0 || x >= ctx.width || y >= ctx.height || ctx.obstacles.read(x, y) {
            continue;
        }
        if ant.visited.contains(&Vec2::new(x, y)) {
            continue;
        }
        let cell = ctx.pheromones.read(x, y, layer);
        let strength = if ant.holding_food {
            cell.to_colony
        } else {
            cell.to_food
        };
        if strength >= best_strength {
            best_strength = strength;
            best_direction = direction;
        }
    }
    (best_direction, best_strength)
}

/// Random-walk fallback: the preferred direction with `move_right_chance`
/// probability, otherwise a uniform delta in `{-1, 0, 1}^2` (the zero vector
/// is allowed and gives a natural stutter).
fn random_movement(ant: &Ant, move_right_chance: f64, rng: &mut Pcg32) -> Vec2 {
    if rng.random::<f64>() <= move_right_chance {
        ant.preferred_dir
    } else {
        Vec2::new(rng.random_range(-1..=1), rng.random_range(-1..=1))
    }
}

/// Sequentially update every live ant of one colony against the clean
/// buffers, accumulating the colony's dirty writes.
fn update_colony(ctx: &AntContext<'_>, colony: &mut Colony, rng: &mut Pcg32) -> ColonyOutcome {
    let mut outcome = ColonyOutcome::default();
    let home = colony.pos;
    let layer = colony.id as i32;

    for ant in &mut colony.ants {
        if ant.dead {
            continue;
        }

        let (direction, strength) = strongest_pheromone(ctx, layer, ant);
        let movement = if strength >= ctx.use_pheromone {
            direction
        } else {
            random_movement(ant, ctx.move_right_chance, rng)
        };

        let next = Vec2::new(ant.pos.x + movement.x, ant.pos.y + movement.y);
        let blocked = next.x < 0
            || next.y < 0
            || next.x >= ctx.width
            || next.y >= ctx.height
            || ctx.obstacles.read(next.x, next.y)
            || (ant.holding_food && ctx.food.read(next.x, next.y));
        if blocked {
            // bounce off: flip the preferred direction, keep the position
            ant.preferred_dir = ant.preferred_dir.inverted();
        } else {
            ant.pos = next;
            ant.visited.insert(next);
        }

        // deposit at the (possibly unchanged) current position; saturates so
        // the channel stays in range across the commit
        let mut cell = ctx.pheromones.read(ant.pos.x, ant.pos.y, layer);
        if ant.holding_food {
            cell.to_food = (cell.to_food + ctx.gain_factor).min(1.0);
        } else {
            cell.to_colony = (cell.to_colony + ctx.gain_factor).min(1.0);
        }
        outcome.pheromone_writes.push((ant.pos, cell));

        if !ant.holding_food && ctx.food.read(ant.pos.x, ant.pos.y) {
            ant.holding_food = true;
            ant.ticks_since_useful = 0;
            ant.preferred_dir = ant.preferred_dir.inverted();
            ant.visited.clear();
            outcome.food_clears.push(ant.pos);
        } else if ant.holding_food && ant.pos.chebyshev(home) <= ctx.return_distance {
            ant.holding_food = false;
            ant.ticks_since_useful = 0;
            ant.visited.clear();
            outcome.reinforce = true;
        }

        if !ant.holding_food {
            ant.ticks_since_useful += 1;
        }
        // noise keeps whole colonies from starving on the same tick
        let noise = rng.random_range(0..=75);
        if ant.ticks_since_useful > ctx.kill_not_useful + noise {
            ant.dead = true;
        }
    }
    outcome
}
