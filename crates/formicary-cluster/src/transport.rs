//! Length-prefixed tagged frames over TCP, and the collective operations the
//! bulk-synchronous tick protocol is built from.
//!
//! Every message is `u32 payload length, u16 tag, payload`. The master owns
//! one stream per worker; ranks are assigned in accept order and confirmed by
//! a `Welcome` frame that also pins the protocol version and world geometry.

use crate::wire::WireError;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use thiserror::Error;
use tracing::debug;

/// Version stamp exchanged in the welcome handshake.
pub const PROTOCOL_VERSION: u16 = 1;

/// Frame tags, one per message kind of the tick protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Tag {
    Welcome = 0,
    TickHeader = 1,
    ColonyScatter = 2,
    ColonyBlob = 3,
    AddAnts = 4,
    FoodData = 5,
    FoodWritten = 6,
    PheromoneData = 7,
    PheromoneWritten = 8,
    Barrier = 9,
    BarrierAck = 10,
}

impl Tag {
    fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::Welcome),
            1 => Some(Self::TickHeader),
            2 => Some(Self::ColonyScatter),
            3 => Some(Self::ColonyBlob),
            4 => Some(Self::AddAnts),
            5 => Some(Self::FoodData),
            6 => Some(Self::FoodWritten),
            7 => Some(Self::PheromoneData),
            8 => Some(Self::PheromoneWritten),
            9 => Some(Self::Barrier),
            10 => Some(Self::BarrierAck),
            _ => None,
        }
    }
}

/// World geometry pinned at the handshake; a mismatch is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: i32,
    pub height: i32,
    pub colonies: u32,
}

/// Fatal wire-protocol failures; these abort the participant.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("transport io: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown frame tag {0}")]
    UnknownTag(u16),
    #[error("unexpected {got:?} frame while waiting for {expected:?}")]
    UnexpectedTag { expected: Tag, got: Tag },
    #[error("{tag:?} frame carries {actual} bytes but the layout expects {expected}")]
    SizeMismatch {
        tag: Tag,
        expected: usize,
        actual: usize,
    },
    #[error("peer speaks protocol {got}, this build speaks {expected}")]
    Version { expected: u16, got: u16 },
    #[error("peer geometry {got:?} does not match ours {ours:?}")]
    Geometry { ours: Geometry, got: Geometry },
    #[error(transparent)]
    Wire(#[from] WireError),
}

fn write_frame(stream: &mut TcpStream, tag: Tag, payload: &[u8]) -> Result<(), ProtocolError> {
    stream.write_all(&(payload.len() as u32).to_le_bytes())?;
    stream.write_all(&(tag as u16).to_le_bytes())?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> Result<(Tag, Vec<u8>), ProtocolError> {
    let mut length = [0u8; 4];
    stream.read_exact(&mut length)?;
    let mut tag = [0u8; 2];
    stream.read_exact(&mut tag)?;
    let raw_tag = u16::from_le_bytes(tag);
    let tag = Tag::from_u16(raw_tag).ok_or(ProtocolError::UnknownTag(raw_tag))?;
    let mut payload = vec![0u8; u32::from_le_bytes(length) as usize];
    stream.read_exact(&mut payload)?;
    Ok((tag, payload))
}

fn expect_frame(
    stream: &mut TcpStream,
    expected: Tag,
    expected_len: Option<usize>,
) -> Result<Vec<u8>, ProtocolError> {
    let (tag, payload) = read_frame(stream)?;
    if tag != expected {
        return Err(ProtocolError::UnexpectedTag { expected, got: tag });
    }
    if let Some(expected_len) = expected_len
        && payload.len() != expected_len
    {
        return Err(ProtocolError::SizeMismatch {
            tag,
            expected: expected_len,
            actual: payload.len(),
        });
    }
    Ok(payload)
}

fn welcome_payload(rank: u32, world_size: u32, geometry: Geometry) -> Vec<u8> {
    let mut payload = Vec::with_capacity(22);
    payload.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    payload.extend_from_slice(&rank.to_le_bytes());
    payload.extend_from_slice(&world_size.to_le_bytes());
    payload.extend_from_slice(&geometry.width.to_le_bytes());
    payload.extend_from_slice(&geometry.height.to_le_bytes());
    payload.extend_from_slice(&geometry.colonies.to_le_bytes());
    payload
}

/// Master side of the collective operations: one ordered stream per worker.
#[derive(Debug)]
pub struct MasterLink {
    workers: Vec<TcpStream>,
}

impl MasterLink {
    /// Accept `workers` connections on `listener`, assign ranks in accept
    /// order and send each worker its welcome.
    pub fn accept(
        listener: &TcpListener,
        workers: usize,
        geometry: Geometry,
    ) -> Result<Self, ProtocolError> {
        let world_size = workers as u32 + 1;
        let mut streams = Vec::with_capacity(workers);
        for rank in 1..=workers as u32 {
            let (mut stream, peer) = listener.accept()?;
            stream.set_nodelay(true)?;
            write_frame(
                &mut stream,
                Tag::Welcome,
                &welcome_payload(rank, world_size, geometry),
            )?;
            debug!(rank, peer = %peer, "worker joined");
            streams.push(stream);
        }
        Ok(Self { workers: streams })
    }

    /// Total participant count including the master.
    #[must_use]
    pub fn world_size(&self) -> usize {
        self.workers.len() + 1
    }

    /// Send the same frame to every worker.
    pub fn broadcast(&mut self, tag: Tag, payload: &[u8]) -> Result<(), ProtocolError> {
        for stream in &mut self.workers {
            write_frame(stream, tag, payload)?;
        }
        Ok(())
    }

    /// Send `chunks[i]` to worker rank `i + 1`.
    pub fn scatter(&mut self, tag: Tag, chunks: &[Vec<u8>]) -> Result<(), ProtocolError> {
        debug_assert_eq!(chunks.len(), self.workers.len());
        for (stream, chunk) in self.workers.iter_mut().zip(chunks) {
            write_frame(stream, tag, chunk)?;
        }
        Ok(())
    }

    /// Receive one frame of `tag` from the given worker slot (0-based, i.e.
    /// rank `worker + 1`), optionally enforcing an exact payload size.
    pub fn recv_from(
        &mut self,
        worker: usize,
        tag: Tag,
        expected_len: Option<usize>,
    ) -> Result<Vec<u8>, ProtocolError> {
        expect_frame(&mut self.workers[worker], tag, expected_len)
    }

    /// Release every worker past the barrier, then wait for all of their
    /// acknowledgements.
    pub fn barrier(&mut self) -> Result<(), ProtocolError> {
        self.broadcast(Tag::Barrier, &[])?;
        for worker in 0..self.workers.len() {
            self.recv_from(worker, Tag::BarrierAck, Some(0))?;
        }
        Ok(())
    }
}

/// Worker side of the collective operations.
#[derive(Debug)]
pub struct WorkerLink {
    stream: TcpStream,
    rank: u32,
    world_size: u32,
}

impl WorkerLink {
    /// Connect to the master and complete the welcome handshake, validating
    /// the protocol version and world geometry.
    pub fn connect<A: ToSocketAddrs>(addr: A, geometry: Geometry) -> Result<Self, ProtocolError> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let payload = expect_frame(&mut stream, Tag::Welcome, Some(22))?;
        let version = u16::from_le_bytes([payload[0], payload[1]]);
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::Version {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        let rank = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]);
        let world_size = u32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]]);
        let got = Geometry {
            width: i32::from_le_bytes([payload[10], payload[11], payload[12], payload[13]]),
            height: i32::from_le_bytes([payload[14], payload[15], payload[16], payload[17]]),
            colonies: u32::from_le_bytes([payload[18], payload[19], payload[20], payload[21]]),
        };
        if got != geometry {
            return Err(ProtocolError::Geometry {
                ours: geometry,
                got,
            });
        }
        debug!(rank, world_size, "joined cluster");
        Ok(Self {
            stream,
            rank,
            world_size,
        })
    }

    /// This participant's rank (1-based; the master is rank 0).
    #[must_use]
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Total participant count including the master.
    #[must_use]
    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    /// Receive one frame of `tag`, optionally enforcing an exact payload size.
    pub fn recv(&mut self, tag: Tag, expected_len: Option<usize>) -> Result<Vec<u8>, ProtocolError> {
        expect_frame(&mut self.stream, tag, expected_len)
    }

    /// Send one frame to the master.
    pub fn send(&mut self, tag: Tag, payload: &[u8]) -> Result<(), ProtocolError> {
        write_frame(&mut self.stream, tag, payload)
    }

    /// Wait for the master's barrier release and acknowledge it.
    pub fn barrier(&mut self) -> Result<(), ProtocolError> {
        self.recv(Tag::Barrier, Some(0))?;
        self.send(Tag::BarrierAck, &[])
    }
}

/// Pack `f64` values little-endian for the wire.
#[must_use]
pub fn doubles_to_bytes(values: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 8);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Unpack little-endian `f64` values, enforcing the expected count.
pub fn bytes_to_doubles(
    tag: Tag,
    bytes: &[u8],
    expected: usize,
) -> Result<Vec<f64>, ProtocolError> {
    if bytes.len() != expected * 8 {
        return Err(ProtocolError::SizeMismatch {
            tag,
            expected: expected * 8,
            actual: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            f64::from_le_bytes(raw)
        })
        .collect())
}

/// Pack booleans as one byte each.
#[must_use]
pub fn bools_to_bytes(values: &[bool]) -> Vec<u8> {
    values.iter().map(|value| u8::from(*value)).collect()
}

/// Unpack one-byte booleans, enforcing the expected count.
pub fn bytes_to_bools(tag: Tag, bytes: &[u8], expected: usize) -> Result<Vec<bool>, ProtocolError> {
    if bytes.len() != expected {
        return Err(ProtocolError::SizeMismatch {
            tag,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(bytes.iter().map(|byte| *byte != 0).collect())
}

/// Pack `i32` values little-endian for the wire.
#[must_use]
pub fn ints_to_bytes(values: &[i32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Unpack little-endian `i32` values, enforcing the expected count.
pub fn bytes_to_ints(tag: Tag, bytes: &[u8], expected: usize) -> Result<Vec<i32>, ProtocolError> {
    if bytes.len() != expected * 4 {
        return Err(ProtocolError::SizeMismatch {
            tag,
            expected: expected * 4,
            actual: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(chunk);
            i32::from_le_bytes(raw)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_packing_round_trips() {
        let doubles = vec![0.5, -1.0, 3.25];
        assert_eq!(
            bytes_to_doubles(Tag::PheromoneData, &doubles_to_bytes(&doubles), 3).expect("doubles"),
            doubles
        );

        let bools = vec![true, false, true, true];
        assert_eq!(
            bytes_to_bools(Tag::FoodData, &bools_to_bytes(&bools), 4).expect("bools"),
            bools
        );

        let ints = vec![-1, 0, 7];
        assert_eq!(
            bytes_to_ints(Tag::AddAnts, &ints_to_bytes(&ints), 3).expect("ints"),
            ints
        );
    }

    #[test]
    fn scalar_unpacking_enforces_sizes() {
        let err = bytes_to_doubles(Tag::PheromoneData, &[0u8; 9], 1).expect_err("size");
        assert!(matches!(err, ProtocolError::SizeMismatch { .. }));
        assert!(bytes_to_bools(Tag::FoodWritten, &[0u8; 3], 4).is_err());
        assert!(bytes_to_ints(Tag::AddAnts, &[0u8; 4], 2).is_err());
    }

    #[test]
    fn welcome_payload_layout_is_stable() {
        let payload = welcome_payload(
            2,
            4,
            Geometry {
                width: 10,
                height: 20,
                colonies: 6,
            },
        );
        assert_eq!(payload.len(), 22);
        assert_eq!(u16::from_le_bytes([payload[0], payload[1]]), PROTOCOL_VERSION);
        assert_eq!(payload[2], 2);
        assert_eq!(payload[6], 4);
        assert_eq!(payload[10], 10);
        assert_eq!(payload[14], 20);
        assert_eq!(payload[18], 6);
    }

    #[test]
    fn tags_round_trip_through_the_wire_encoding() {
        for raw in 0..=10u16 {
            let tag = Tag::from_u16(raw).expect("tag");
            assert_eq!(tag as u16, raw);
        }
        assert!(Tag::from_u16(11).is_none());
    }
}
