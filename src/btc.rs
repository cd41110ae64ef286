// Copyright (C) 2020  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Bitcoin header arithmetic: double SHA256 digest, SHA256 midstate
//! pre-computation and the coinbase/Merkle reduction that turns a mining
//! notification into the 76-byte header prefix consumed by the hashing
//! hardware.

use bitcoin_hashes::{sha256d, Hash as HashTrait};

use sha2::compress256;
use sha2::digest::generic_array::GenericArray;

/// SHA256 digest size used in Bitcoin protocol
pub const SHA256_DIGEST_SIZE: usize = 32;

/// A Bitcoin block header is 80 bytes long
pub const BLOCK_HEADER_SIZE: usize = 80;

/// First chunk of Bitcoin block header used for midstate computation
pub const BLOCK_HEADER_CHUNK1_SIZE: usize = 64;

/// Header prefix without the nonce (version, previous hash, merkle root,
/// time, bits). The last 4 bytes of the full header are discovered by the
/// accelerators.
pub const BLOCK_HEADER_PREFIX_SIZE: usize = 76;

/// SHA256 initialization vector (FIPS 180-4)
const SHA256_IV: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

/// Array containing SHA256 digest
pub type Sha256Array = [u8; SHA256_DIGEST_SIZE];

/// Compute SHA256 double hash of arbitrary data.
/// The digest is returned in natural (internal) byte order, no reversal is
/// performed at this step.
pub fn double_hash(data: &[u8]) -> Sha256Array {
    sha256d::Hash::hash(data).to_byte_array()
}

/// Compute SHA256 midstate from one 64-byte chunk.
///
/// The compression function is applied exactly once starting from the
/// standard initialization vector; no padding is involved. The resulting
/// internal state is serialized as 8 big-endian 32-bit words in natural
/// order (word 0 first) which is the representation the accelerator
/// firmware expects on its shared bus.
pub fn midstate(chunk1: &[u8; BLOCK_HEADER_CHUNK1_SIZE]) -> Sha256Array {
    let mut state = SHA256_IV;
    let block = GenericArray::clone_from_slice(&chunk1[..]);
    compress256(&mut state, core::slice::from_ref(&block));

    let mut bytes = [0u8; SHA256_DIGEST_SIZE];
    for (chunk, word) in bytes.chunks_mut(4).zip(state.iter()) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    bytes
}

/// Compute the double hash of the assembled coinbase transaction.
/// The extra nonces are spliced between the two server supplied runs.
pub fn coinbase_digest(
    coinbase_1: &[u8],
    extra_nonce_1: &[u8],
    extra_nonce_2: &[u8],
    coinbase_2: &[u8],
) -> Sha256Array {
    let mut coinbase =
        Vec::with_capacity(coinbase_1.len() + extra_nonce_1.len() + extra_nonce_2.len() + coinbase_2.len());
    coinbase.extend_from_slice(coinbase_1);
    coinbase.extend_from_slice(extra_nonce_1);
    coinbase.extend_from_slice(extra_nonce_2);
    coinbase.extend_from_slice(coinbase_2);
    double_hash(&coinbase)
}

/// Reduce the coinbase digest and the notification's merkle branch into the
/// merkle root, folding left to right with the double hash. The final
/// reversal converts the accumulator into the byte order the block header
/// uses.
pub fn merkle_root(coinbase_digest: Sha256Array, merkle_branch: &[Sha256Array]) -> Sha256Array {
    let mut acc = coinbase_digest;
    for branch in merkle_branch {
        let mut concat = [0u8; 2 * SHA256_DIGEST_SIZE];
        concat[..SHA256_DIGEST_SIZE].copy_from_slice(&acc);
        concat[SHA256_DIGEST_SIZE..].copy_from_slice(branch);
        acc = double_hash(&concat);
    }
    acc.reverse();
    acc
}

/// Assemble the 76-byte block header prefix. All fields must already be in
/// header byte order.
pub fn pack_header_prefix(
    version: &[u8; 4],
    previous_hash: &Sha256Array,
    merkle_root: &Sha256Array,
    timestamp: &[u8; 4],
    bits: &[u8; 4],
) -> [u8; BLOCK_HEADER_PREFIX_SIZE] {
    let mut header = [0u8; BLOCK_HEADER_PREFIX_SIZE];
    header[0..4].copy_from_slice(version);
    header[4..36].copy_from_slice(previous_hash);
    header[36..68].copy_from_slice(merkle_root);
    header[68..72].copy_from_slice(timestamp);
    header[72..76].copy_from_slice(bits);
    header
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::test_utils;

    #[test]
    fn test_block_double_hash() {
        for block in test_utils::TEST_BLOCKS.iter() {
            let block_hash = double_hash(&block.header_bytes);

            // block hashes are displayed with reversed byte order
            let mut display = block_hash;
            display.reverse();
            assert_eq!(block.hash_str, hex::encode(display));
        }
    }

    #[test]
    fn test_block_header_midstate() {
        for block in test_utils::TEST_BLOCKS.iter() {
            let mut chunk1 = [0u8; BLOCK_HEADER_CHUNK1_SIZE];
            chunk1.copy_from_slice(&block.header_bytes[..BLOCK_HEADER_CHUNK1_SIZE]);
            assert_eq!(block.midstate, midstate(&chunk1));
        }
    }

    #[test]
    fn test_midstate_known_chunks() {
        // independently computed vectors for the raw compression call
        assert_eq!(
            hex::encode(midstate(&[0u8; 64])),
            "da5698be17b9b46962335799779fbeca8ce5d491c0d26243bafef9ea1837a9d8"
        );

        let mut counting = [0u8; 64];
        for (i, byte) in counting.iter_mut().enumerate() {
            *byte = i as u8;
        }
        assert_eq!(
            hex::encode(midstate(&counting)),
            "fc99a2df88f42a7a7bb9d18033cdc6a20256755f9d5b9a5044a9cc315abe84a7"
        );
    }

    #[test]
    fn test_double_hash_basic() {
        assert_eq!(
            hex::encode(double_hash(b"hello")),
            "9595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50"
        );
    }

    #[test]
    /// Merkle reduction with an empty branch only reverses the coinbase digest
    fn test_merkle_root_empty_branch() {
        let digest = double_hash(b"coinbase");
        let mut reversed = digest;
        reversed.reverse();
        assert_eq!(reversed, merkle_root(digest, &[]));
    }

    #[test]
    /// root = reverse(digest(digest(C || B1) || B2))
    fn test_merkle_root_two_branches() {
        let coinbase = double_hash(b"coinbase");
        let branch_1 = [0x11u8; 32];
        let branch_2 = [0x22u8; 32];

        let mut concat = Vec::new();
        concat.extend_from_slice(&coinbase);
        concat.extend_from_slice(&branch_1);
        let step_1 = double_hash(&concat);

        concat.clear();
        concat.extend_from_slice(&step_1);
        concat.extend_from_slice(&branch_2);
        let mut expected = double_hash(&concat);
        expected.reverse();

        assert_eq!(expected, merkle_root(coinbase, &[branch_1, branch_2]));
    }

    #[test]
    fn test_pack_header_prefix() {
        for block in test_utils::TEST_BLOCKS.iter() {
            let header = pack_header_prefix(
                &block.version,
                &block.previous_hash,
                &block.merkle_root,
                &block.time,
                &block.bits,
            );
            assert_eq!(block.header_bytes[..BLOCK_HEADER_PREFIX_SIZE], header[..]);
        }
    }
}
