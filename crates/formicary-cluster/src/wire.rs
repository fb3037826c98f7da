//! Versioned positional binary encoding for the colony exchange.
//!
//! Layout: wire version (u16), colony count (u32), then per colony
//! { id u32, colour 3xu8, pos 2xi32, hunger f64, dead u8, ant count u32 }
//! followed by its ants { id u64, pos 2xi32, holding u8, preferred 2xi32,
//! ticks i32, dead u8, visited count u32, visited positions 2xi32 each }.
//! All integers little-endian; no field names on the wire.

use formicary_core::{Ant, Colony, Rgb, Vec2};
use std::collections::HashSet;
use thiserror::Error;

/// Version stamp leading every colony blob.
pub const WIRE_VERSION: u16 = 1;

/// Decode failures for positional blobs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("blob truncated at byte {at}")]
    Truncated { at: usize },
    #[error("blob carries wire version {got}, this build speaks {expected}")]
    Version { expected: u16, got: u16 },
    #[error("{0} trailing bytes after the final colony")]
    Trailing(usize),
}

/// Encode colonies positionally. Visited sets are emitted in sorted order so
/// identical state always produces identical bytes.
#[must_use]
pub fn encode_colonies(colonies: &[Colony]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&WIRE_VERSION.to_le_bytes());
    out.extend_from_slice(&(colonies.len() as u32).to_le_bytes());
    for colony in colonies {
        out.extend_from_slice(&colony.id.to_le_bytes());
        out.extend_from_slice(&[colony.colour.r, colony.colour.g, colony.colour.b]);
        put_vec2(&mut out, colony.pos);
        out.extend_from_slice(&colony.hunger.to_le_bytes());
        out.push(u8::from(colony.dead));
        out.extend_from_slice(&(colony.ants.len() as u32).to_le_bytes());
        for ant in &colony.ants {
            out.extend_from_slice(&ant.id.to_le_bytes());
            put_vec2(&mut out, ant.pos);
            out.push(u8::from(ant.holding_food));
            put_vec2(&mut out, ant.preferred_dir);
            out.extend_from_slice(&ant.ticks_since_useful.to_le_bytes());
            out.push(u8::from(ant.dead));
            let mut visited: Vec<Vec2> = ant.visited.iter().copied().collect();
            visited.sort_unstable();
            out.extend_from_slice(&(visited.len() as u32).to_le_bytes());
            for pos in visited {
                put_vec2(&mut out, pos);
            }
        }
    }
    out
}

/// Decode a positional colony blob produced by [`encode_colonies`].
pub fn decode_colonies(bytes: &[u8]) -> Result<Vec<Colony>, WireError> {
    let mut reader = Reader::new(bytes);
    let version = reader.take_u16()?;
    if version != WIRE_VERSION {
        return Err(WireError::Version {
            expected: WIRE_VERSION,
            got: version,
        });
    }
    let colony_count = reader.take_u32()? as usize;
    let mut colonies = Vec::with_capacity(colony_count);
    for _ in 0..colony_count {
        let id = reader.take_u32()?;
        let colour = Rgb::new(reader.take_u8()?, reader.take_u8()?, reader.take_u8()?);
        let pos = reader.take_vec2()?;
        let hunger = reader.take_f64()?;
        let dead = reader.take_u8()? != 0;
        let ant_count = reader.take_u32()? as usize;
        let mut ants = Vec::with_capacity(ant_count);
        for _ in 0..ant_count {
            let ant_id = reader.take_u64()?;
            let ant_pos = reader.take_vec2()?;
            let holding_food = reader.take_u8()? != 0;
            let preferred_dir = reader.take_vec2()?;
            let ticks_since_useful = reader.take_i32()?;
            let ant_dead = reader.take_u8()? != 0;
            let visited_count = reader.take_u32()? as usize;
            let mut visited = HashSet::with_capacity(visited_count);
            for _ in 0..visited_count {
                visited.insert(reader.take_vec2()?);
            }
            ants.push(Ant {
                id: ant_id,
                pos: ant_pos,
                holding_food,
                preferred_dir,
                ticks_since_useful,
                visited,
                dead: ant_dead,
            });
        }
        colonies.push(Colony {
            id,
            colour,
            pos,
            hunger,
            ants,
            dead,
        });
    }
    reader.finish()?;
    Ok(colonies)
}

fn put_vec2(out: &mut Vec<u8>, value: Vec2) {
    out.extend_from_slice(&value.x.to_le_bytes());
    out.extend_from_slice(&value.y.to_le_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, at: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let end = self.at + N;
        let slice = self
            .bytes
            .get(self.at..end)
            .ok_or(WireError::Truncated { at: self.at })?;
        self.at = end;
        let mut array = [0u8; N];
        array.copy_from_slice(slice);
        Ok(array)
    }

    fn take_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take::<1>()?[0])
    }

    fn take_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn take_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn take_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn take_i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    fn take_f64(&mut self) -> Result<f64, WireError> {
        Ok(f64::from_le_bytes(self.take()?))
    }

    fn take_vec2(&mut self) -> Result<Vec2, WireError> {
        Ok(Vec2::new(self.take_i32()?, self.take_i32()?))
    }

    fn finish(&self) -> Result<(), WireError> {
        if self.at == self.bytes.len() {
            Ok(())
        } else {
            Err(WireError::Trailing(self.bytes.len() - self.at))
        }
    }
}
