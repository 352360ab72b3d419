//! Outgoing synchronization records and their binary encoding.
//!
//! Records are serialized with postcard behind a one-byte version prefix. The
//! enum discriminant is the record tag.

use glam::{DVec3, IVec3};
use serde::{Deserialize, Serialize};

use meridian_world::{ResourceId, ResourceKind};

use crate::compact::CompactId;
use crate::error::RecordError;

/// Current record format version.
pub const RECORD_VERSION: u8 = 1;

/// Voxel cuboid with its voxel type replaced by the session's compact id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactVoxelCube {
    pub voxel: CompactId,
    pub min: [u8; 3],
    pub max: [u8; 3],
}

/// Node placement with its node definition replaced by a compact id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactNode {
    pub cell: u16,
    pub node: CompactId,
}

/// One instruction to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Record {
    /// A resource becomes referenced; always precedes its first use.
    ResourceNew {
        kind: ResourceKind,
        compact: CompactId,
        id: ResourceId,
    },
    /// A resource is no longer referenced; always follows its last use.
    ResourceReleased { kind: ResourceKind, compact: CompactId },
    RegionEntered { world: CompactId, region: IVec3 },
    RegionLost { world: CompactId, region: IVec3 },
    ChunkData {
        world: CompactId,
        region: IVec3,
        index: u8,
        voxels: Vec<CompactVoxelCube>,
        nodes: Vec<CompactNode>,
    },
    ChunkLost { world: CompactId, region: IVec3, index: u8 },
    EntityNew {
        entity: CompactId,
        def: CompactId,
        world: CompactId,
        position: DVec3,
        half_extent: DVec3,
    },
    EntityUpdate { entity: CompactId, position: DVec3 },
    /// The entity changed region; its compact id is unchanged.
    EntitySwap {
        entity: CompactId,
        world: CompactId,
        region: IVec3,
    },
    EntityLost { entity: CompactId },
    Disconnect { reason: String },
    /// Closes the records of one tick.
    TickEnd { tick: u64 },
}

impl Record {
    /// Versioned binary form.
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        let body = postcard::to_allocvec(self)?;
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(RECORD_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Record, RecordError> {
        let (&version, body) = data.split_first().ok_or(RecordError::EmptyPayload)?;
        if version != RECORD_VERSION {
            return Err(RecordError::UnsupportedVersion(version));
        }
        Ok(postcard::from_bytes(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_record_survives_encoding() {
        let record = Record::ChunkData {
            world: CompactId(0),
            region: IVec3::new(-2, 0, 5),
            index: 63,
            voxels: vec![CompactVoxelCube {
                voxel: CompactId(4),
                min: [0, 0, 0],
                max: [15, 3, 15],
            }],
            nodes: vec![CompactNode {
                cell: 300,
                node: CompactId(1),
            }],
        };
        let bytes = record.encode().unwrap();
        assert_eq!(bytes[0], RECORD_VERSION);
        assert_eq!(Record::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut bytes = Record::TickEnd { tick: 3 }.encode().unwrap();
        bytes[0] = 255;
        assert!(matches!(
            Record::decode(&bytes),
            Err(RecordError::UnsupportedVersion(255))
        ));
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(Record::decode(&[]), Err(RecordError::EmptyPayload)));
    }

    #[test]
    fn test_corrupted_payload_rejected() {
        assert!(Record::decode(&[RECORD_VERSION, 0xff, 0xff, 0xff]).is_err());
    }
}
