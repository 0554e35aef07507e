//! Merkle tree over padded chunk hashes, with fixed-length inclusion proofs.
//!
//! Leaves are SHA-512 digests of padded chunks. Parents are
//! `SHA-512(left || right)`; a trailing odd node is paired with itself.
//! A single-leaf tree's root is the leaf.
//!
//! Proofs always encode to [`PROOF_LEN`] bytes:
//!
//! ```text
//! steps (u8) || { side (u8) || sibling (64) } * MERKLE_MAX_DEPTH
//! ```
//!
//! where `side` is `0` when the sibling sits on the left and `1` when it sits
//! on the right. Unused slots are zero. A constant proof size keeps frame
//! lengths independent of the tree depth.

use crate::core::config::{HASH_LEN, MERKLE_MAX_DEPTH, PROOF_LEN};
use crate::core::error::{TransferError, TransferResult};
use crate::core::security::crypto;

pub type Hash = [u8; HASH_LEN];

const STEP_LEN: usize = 1 + HASH_LEN;

/// A Merkle tree built from chunk hashes. Keeps every level so proofs are
/// read off without recomputation.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// `levels[0]` are the leaves, the last level holds the root alone.
    levels: Vec<Vec<Hash>>,
}

/// Position of a sibling relative to the running hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofStep {
    pub side: Side,
    pub sibling: Hash,
}

/// Inclusion proof for one leaf, ordered from the leaf level upwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    steps: Vec<ProofStep>,
}

impl MerkleTree {
    /// Build a tree from an ordered list of leaf hashes.
    pub fn build(leaves: &[Hash]) -> TransferResult<Self> {
        if leaves.is_empty() {
            return Err(TransferError::InvalidParameters(
                "merkle tree needs at least one leaf".into(),
            ));
        }
        if leaves.len() > 1usize << MERKLE_MAX_DEPTH {
            return Err(TransferError::InvalidParameters(format!(
                "{} leaves exceed the maximum merkle depth",
                leaves.len()
            )));
        }

        let mut levels = vec![leaves.to_vec()];
        while let Some(current) = levels.last().filter(|l| l.len() > 1) {
            let next: Vec<Hash> = current
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                .collect();
            levels.push(next);
        }
        Ok(Self { levels })
    }

    pub fn root(&self) -> &Hash {
        &self.levels[self.levels.len() - 1][0]
    }

    pub fn leaves(&self) -> &[Hash] {
        &self.levels[0]
    }

    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    /// Inclusion proof for the leaf at `index`, or `None` if out of range.
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaves().len() {
            return None;
        }

        let mut steps = Vec::with_capacity(self.depth());
        let mut idx = index;
        for level in &self.levels[..self.depth()] {
            let step = if idx % 2 == 0 {
                // Odd trailing node: its sibling is itself.
                let sibling = level.get(idx + 1).unwrap_or(&level[idx]);
                ProofStep {
                    side: Side::Right,
                    sibling: *sibling,
                }
            } else {
                ProofStep {
                    side: Side::Left,
                    sibling: level[idx - 1],
                }
            };
            steps.push(step);
            idx /= 2;
        }
        Some(MerkleProof { steps })
    }
}

impl MerkleProof {
    pub fn steps(&self) -> &[ProofStep] {
        &self.steps
    }

    /// Encode into the fixed [`PROOF_LEN`] layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; PROOF_LEN];
        out[0] = self.steps.len() as u8;
        for (i, step) in self.steps.iter().enumerate() {
            let off = 1 + i * STEP_LEN;
            out[off] = match step.side {
                Side::Left => 0,
                Side::Right => 1,
            };
            out[off + 1..off + STEP_LEN].copy_from_slice(&step.sibling);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> TransferResult<Self> {
        if bytes.len() != PROOF_LEN {
            return Err(TransferError::MalformedFrame("proof length"));
        }
        let count = bytes[0] as usize;
        if count > MERKLE_MAX_DEPTH {
            return Err(TransferError::MalformedFrame("proof depth"));
        }

        let mut steps = Vec::with_capacity(count);
        for i in 0..count {
            let off = 1 + i * STEP_LEN;
            let side = match bytes[off] {
                0 => Side::Left,
                1 => Side::Right,
                _ => return Err(TransferError::MalformedFrame("proof side")),
            };
            let mut sibling = [0u8; HASH_LEN];
            sibling.copy_from_slice(&bytes[off + 1..off + STEP_LEN]);
            steps.push(ProofStep { side, sibling });
        }
        Ok(Self { steps })
    }
}

/// Root of `leaves`. Convenience over [`MerkleTree::build`].
pub fn merkle_root(leaves: &[Hash]) -> TransferResult<Hash> {
    Ok(*MerkleTree::build(leaves)?.root())
}

/// Check that `leaf` is committed to by `root` through `proof`.
pub fn verify_proof(leaf: &Hash, root: &Hash, proof: &MerkleProof) -> bool {
    let computed = proof.steps.iter().fold(*leaf, |acc, step| match step.side {
        Side::Left => hash_pair(&step.sibling, &acc),
        Side::Right => hash_pair(&acc, &step.sibling),
    });
    &computed == root
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    crypto::hash_parts(&[left, right])
}
