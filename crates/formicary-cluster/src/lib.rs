//! Distributed master/worker variant of the tick driver.
//!
//! Every participant holds a full copy of the world; the master's copy is
//! authoritative. Each tick the master broadcasts the per-tick seed and the
//! dirty halves of the food and pheromone fields (obstacles never change
//! after init), scatters contiguous colony chunks, computes its own share of
//! the ant update, then merges each worker's colony blob and per-cell written
//! masks back into its grids before running bookkeeping and the termination
//! decision. Barriers follow every exchange; nothing overlaps within a tick.

pub mod transport;
pub mod wire;

use formicary_core::{PheromoneStrength, TickOutcome, World, WorldError};
use transport::{
    Geometry, MasterLink, ProtocolError, Tag, WorkerLink, bools_to_bytes, bytes_to_bools,
    bytes_to_doubles, bytes_to_ints, doubles_to_bytes, ints_to_bytes,
};
use tracing::{debug, info};

/// Contiguous chunk size per participant; colony count must divide evenly.
pub fn colonies_per_participant(
    colonies: usize,
    world_size: usize,
) -> Result<usize, WorldError> {
    if world_size == 0 || !colonies.is_multiple_of(world_size) {
        return Err(WorldError::UnevenColonySplit {
            colonies,
            participants: world_size,
        });
    }
    Ok(colonies / world_size)
}

/// The geometry pinned in the welcome handshake.
#[must_use]
pub fn geometry_of(world: &World) -> Geometry {
    Geometry {
        width: world.width(),
        height: world.height(),
        colonies: world.colonies().len() as u32,
    }
}

fn tick_header(halt: bool, seed: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(9);
    payload.push(u8::from(halt));
    payload.extend_from_slice(&seed.to_le_bytes());
    payload
}

fn parse_tick_header(payload: &[u8]) -> Result<(bool, u64), ProtocolError> {
    if payload.len() != 9 {
        return Err(ProtocolError::SizeMismatch {
            tag: Tag::TickHeader,
            expected: 9,
            actual: payload.len(),
        });
    }
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&payload[1..9]);
    Ok((payload[0] != 0, u64::from_le_bytes(seed)))
}

fn grid_cells(world: &World) -> usize {
    (world.width() as usize) * (world.height() as usize)
}

/// Master side of the distributed driver.
#[derive(Debug)]
pub struct Master {
    link: MasterLink,
    per_participant: usize,
}

impl Master {
    /// Wrap an accepted link, checking the colony split against its size.
    pub fn new(world: &World, link: MasterLink) -> Result<Self, WorldError> {
        let per_participant =
            colonies_per_participant(world.colonies().len(), link.world_size())?;
        info!(
            world_size = link.world_size(),
            per_participant, "cluster assembled"
        );
        Ok(Self {
            link,
            per_participant,
        })
    }

    /// Drive one distributed tick and return its outcome.
    pub fn tick(&mut self, world: &mut World) -> Result<TickOutcome, ProtocolError> {
        let seed = world.draw_tick_seed();
        let cells = grid_cells(world);
        let depth = world.pheromones().depth() as usize;
        let workers = self.link.world_size() - 1;

        // broadcast the seed and the dirty grid halves
        self.link
            .broadcast(Tag::TickHeader, &tick_header(false, seed))?;
        self.link
            .broadcast(Tag::FoodData, &bools_to_bytes(world.food().dirty_cells()))?;
        self.link.broadcast(
            Tag::PheromoneData,
            &doubles_to_bytes(&world.pack_pheromones()),
        )?;
        self.link.barrier()?;

        // decay replicates on every participant against the broadcast state
        world.decay_pheromones();

        // scatter contiguous colony chunks; chunk 0 stays with the master
        let chunks: Vec<Vec<u8>> = (0..workers)
            .map(|worker| {
                let base = (worker + 1) * self.per_participant;
                let indices: Vec<i32> =
                    (base..base + self.per_participant).map(|i| i as i32).collect();
                ints_to_bytes(&indices)
            })
            .collect();
        self.link.scatter(Tag::ColonyScatter, &chunks)?;
        self.link.barrier()?;

        let own: Vec<usize> = (0..self.per_participant).collect();
        let mut reinforce = world.update_colonies(Some(&own), seed);
        self.link.barrier()?;

        // colony exchange: worker blobs overwrite the master's entries at the
        // worker's indices, positionally
        for worker in 0..workers {
            let blob = self.link.recv_from(worker, Tag::ColonyBlob, None)?;
            let received = wire::decode_colonies(&blob)?;
            if received.len() != self.per_participant {
                return Err(ProtocolError::SizeMismatch {
                    tag: Tag::ColonyBlob,
                    expected: self.per_participant,
                    actual: received.len(),
                });
            }
            let base = (worker + 1) * self.per_participant;
            for (offset, colony) in received.into_iter().enumerate() {
                world.colonies_mut()[base + offset] = colony;
            }

            let raw = self
                .link
                .recv_from(worker, Tag::AddAnts, Some(self.per_participant * 4))?;
            for signal in bytes_to_ints(Tag::AddAnts, &raw, self.per_participant)? {
                if signal >= 0 {
                    reinforce[signal as usize] = true;
                }
            }
            debug!(worker, "merged colony exchange");
        }
        self.link.barrier()?;

        // grid exchange: copy every cell a worker's mask claims
        for worker in 0..workers {
            let raw = self.link.recv_from(worker, Tag::FoodData, Some(cells))?;
            let food = bytes_to_bools(Tag::FoodData, &raw, cells)?;
            let raw = self.link.recv_from(worker, Tag::FoodWritten, Some(cells))?;
            let food_written = bytes_to_bools(Tag::FoodWritten, &raw, cells)?;
            for y in 0..world.height() {
                for x in 0..world.width() {
                    let index = (x + world.width() * y) as usize;
                    if food_written[index] {
                        world.food_mut().write(x, y, food[index]);
                    }
                }
            }

            let raw =
                self.link
                    .recv_from(worker, Tag::PheromoneData, Some(cells * depth * 2 * 8))?;
            let pheromones = bytes_to_doubles(Tag::PheromoneData, &raw, cells * depth * 2)?;
            let raw =
                self.link
                    .recv_from(worker, Tag::PheromoneWritten, Some(cells * depth))?;
            let pheromone_written = bytes_to_bools(Tag::PheromoneWritten, &raw, cells * depth)?;
            // the data buffer is cell-major, colony-innermost; the mask keeps
            // the grid's native stride
            let mut data_index = 0;
            for y in 0..world.height() {
                for x in 0..world.width() {
                    for z in 0..depth as i32 {
                        let value = PheromoneStrength::new(
                            pheromones[data_index],
                            pheromones[data_index + 1],
                        );
                        data_index += 2;
                        let mask_index =
                            (x + world.width() * y) as usize + cells * z as usize;
                        if pheromone_written[mask_index] {
                            world.pheromones_mut().write(x, y, z, value);
                        }
                    }
                }
            }
            debug!(worker, "merged grid exchange");
        }
        self.link.barrier()?;

        world.apply_reinforcement(&reinforce, seed, None);
        Ok(world.finish_tick())
    }

    /// Release every worker with a halt header so they exit cleanly.
    pub fn shutdown(mut self) -> Result<(), ProtocolError> {
        self.link.broadcast(Tag::TickHeader, &tick_header(true, 0))
    }
}

/// Worker side of the distributed driver.
#[derive(Debug)]
pub struct Worker {
    link: WorkerLink,
    per_participant: usize,
}

impl Worker {
    /// Wrap a connected link, checking the colony split against its size.
    pub fn new(world: &World, link: WorkerLink) -> Result<Self, WorldError> {
        let per_participant =
            colonies_per_participant(world.colonies().len(), link.world_size() as usize)?;
        Ok(Self {
            link,
            per_participant,
        })
    }

    /// Participate in one distributed tick. Returns `false` when the master
    /// signalled the halt.
    pub fn tick(&mut self, world: &mut World) -> Result<bool, ProtocolError> {
        let (halt, seed) = parse_tick_header(&self.link.recv(Tag::TickHeader, Some(9))?)?;
        if halt {
            info!("halt received from master");
            return Ok(false);
        }
        let cells = grid_cells(world);
        let depth = world.pheromones().depth() as usize;

        // unpack the broadcast into the dirty halves, then commit so the tick
        // starts from clean == dirty
        let raw = self.link.recv(Tag::FoodData, Some(cells))?;
        let food = bytes_to_bools(Tag::FoodData, &raw, cells)?;
        world.food_mut().dirty_cells_mut().copy_from_slice(&food);
        let raw = self.link.recv(Tag::PheromoneData, Some(cells * depth * 2 * 8))?;
        let pheromones = bytes_to_doubles(Tag::PheromoneData, &raw, cells * depth * 2)?;
        world.unpack_pheromones(&pheromones);
        world.food_mut().commit();
        world.pheromones_mut().commit();
        self.link.barrier()?;

        world.decay_pheromones();

        let raw = self
            .link
            .recv(Tag::ColonyScatter, Some(self.per_participant * 4))?;
        let own: Vec<usize> = bytes_to_ints(Tag::ColonyScatter, &raw, self.per_participant)?
            .into_iter()
            .map(|index| index as usize)
            .collect();
        self.link.barrier()?;

        let reinforce = world.update_colonies(Some(&own), seed);
        self.link.barrier()?;

        // send back exactly the colonies this worker owns, in index order
        let owned: Vec<formicary_core::Colony> = own
            .iter()
            .map(|&index| world.colonies()[index].clone())
            .collect();
        self.link
            .send(Tag::ColonyBlob, &wire::encode_colonies(&owned))?;
        let signals: Vec<i32> = own
            .iter()
            .map(|&index| if reinforce[index] { index as i32 } else { -1 })
            .collect();
        self.link.send(Tag::AddAnts, &ints_to_bytes(&signals))?;
        self.link.barrier()?;

        self.link
            .send(Tag::FoodData, &bools_to_bytes(world.food().dirty_cells()))?;
        self.link.send(
            Tag::FoodWritten,
            &bools_to_bytes(world.food().written_cells()),
        )?;
        self.link.send(
            Tag::PheromoneData,
            &doubles_to_bytes(&world.pack_pheromones()),
        )?;
        self.link.send(
            Tag::PheromoneWritten,
            &bools_to_bytes(world.pheromones().written_cells()),
        )?;
        self.link.barrier()?;

        // keep this worker's authoritative colonies current, then commit for
        // the next broadcast
        world.apply_reinforcement(&reinforce, seed, Some(&own));
        world.colony_upkeep(Some(&own));
        world.food_mut().commit();
        world.pheromones_mut().commit();
        Ok(true)
    }

    /// Loop ticks until the master signals the halt.
    pub fn run(&mut self, world: &mut World) -> Result<(), ProtocolError> {
        while self.tick(world)? {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colony_split_must_be_even() {
        assert_eq!(colonies_per_participant(4, 2), Ok(2));
        assert_eq!(colonies_per_participant(6, 3), Ok(2));
        assert_eq!(
            colonies_per_participant(5, 2),
            Err(WorldError::UnevenColonySplit {
                colonies: 5,
                participants: 2
            })
        );
        assert!(colonies_per_participant(4, 0).is_err());
    }

    #[test]
    fn tick_header_round_trips() {
        let payload = tick_header(false, 0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(
            parse_tick_header(&payload).expect("header"),
            (false, 0xDEAD_BEEF_CAFE_F00D)
        );
        let payload = tick_header(true, 0);
        assert_eq!(parse_tick_header(&payload).expect("header"), (true, 0));
        assert!(parse_tick_header(&[0u8; 8]).is_err());
    }
}
