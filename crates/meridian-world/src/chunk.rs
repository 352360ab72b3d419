//! Chunk contents: voxel cuboids and placed nodes.

use serde::{Deserialize, Serialize};

use crate::content::{ResourceId, ResourceKind, ResourceRef};

/// An axis-aligned run of a single voxel type, in chunk-local cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoxelCube {
    pub voxel: ResourceId,
    pub min: [u8; 3],
    pub max: [u8; 3],
}

/// A node definition placed at a chunk-local cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePlacement {
    /// Cell index `x | y << 4 | z << 8`.
    pub cell: u16,
    pub node: ResourceId,
}

/// Content of one chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub voxels: Vec<VoxelCube>,
    pub nodes: Vec<NodePlacement>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunk filled with a single voxel type.
    pub fn filled(voxel: ResourceId) -> Self {
        Self {
            voxels: vec![VoxelCube {
                voxel,
                min: [0; 3],
                max: [15; 3],
            }],
            nodes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty() && self.nodes.is_empty()
    }

    /// Definitions referenced directly by this chunk, sorted and deduplicated.
    pub fn dependencies(&self) -> Vec<ResourceRef> {
        let mut deps: Vec<ResourceRef> = self
            .voxels
            .iter()
            .map(|cube| ResourceRef::new(ResourceKind::Voxel, cube.voxel))
            .chain(
                self.nodes
                    .iter()
                    .map(|n| ResourceRef::new(ResourceKind::Node, n.node)),
            )
            .collect();
        deps.sort_unstable();
        deps.dedup();
        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependencies_deduplicate() {
        let mut chunk = Chunk::filled(3);
        chunk.voxels.push(VoxelCube {
            voxel: 3,
            min: [0, 0, 0],
            max: [1, 1, 1],
        });
        chunk.nodes.push(NodePlacement { cell: 17, node: 9 });

        assert_eq!(
            chunk.dependencies(),
            vec![
                ResourceRef::new(ResourceKind::Voxel, 3),
                ResourceRef::new(ResourceKind::Node, 9),
            ]
        );
    }

    #[test]
    fn test_empty_chunk_has_no_dependencies() {
        let chunk = Chunk::new();
        assert!(chunk.is_empty());
        assert!(chunk.dependencies().is_empty());
    }
}
