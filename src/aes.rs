//! Access model for a T-table AES implementation.
//!
//! A first-round lookup into table `t` for state byte `p` reads entry
//! `key[p] ^ plaintext[p]`. With 16 table entries per cache line, the line
//! index visible to a cache observer is the top nibble of that value. This
//! module derives, for a chosen key and plaintext, the relative line
//! distances an attacker can expect to observe between the anchor lookup of a
//! table and its three dependent lookups.

use crate::state::StateBitvector;

/// Number of lookup tables in the victim implementation.
pub const TABLE_COUNT: usize = 4;

/// Number of bytes in the AES state.
pub const STATE_BYTES: usize = 16;

/// Table entries sharing one cache line; `entry >> LINE_SHIFT` is the line index.
const LINE_SHIFT: u32 = 4;

/// State byte positions feeding each lookup table, in execution order.
///
/// The first position of each row is the anchor, the remaining three are
/// dependents. The interleaving is fixed by the victim's four-way parallel
/// table lookups and never changes.
const TABLE_POSITIONS: [[usize; 4]; TABLE_COUNT] = [
    [0, 4, 8, 12],  // FT0
    [5, 9, 13, 1],  // FT1
    [10, 14, 2, 6], // FT2
    [15, 3, 7, 11], // FT3
];

/// Derives expected cache line access patterns for one attack session.
///
/// The key is fixed for the lifetime of the model; the plaintext buffer is
/// perturbed per experiment and restored with [`AccessModel::reset`].
#[derive(Debug, Clone)]
pub struct AccessModel {
    key: [u8; STATE_BYTES],
    initial_plaintext: [u8; STATE_BYTES],
    plaintext: [u8; STATE_BYTES],
}

impl AccessModel {
    pub fn new(key: [u8; STATE_BYTES], initial_plaintext: [u8; STATE_BYTES]) -> Self {
        Self {
            key,
            initial_plaintext,
            plaintext: initial_plaintext,
        }
    }

    /// Restores the plaintext buffer to its initial value.
    pub fn reset(&mut self) {
        self.plaintext = self.initial_plaintext;
    }

    /// Sets one plaintext byte, as done at the start of an anchor experiment.
    pub fn set_byte(&mut self, position: usize, value: u8) {
        self.plaintext[position] = value;
    }

    /// Flips one bit of a plaintext byte, as done for a dependent experiment.
    pub fn flip_bit(&mut self, position: usize, bit: u8) {
        self.plaintext[position] ^= 1 << bit;
    }

    pub fn plaintext(&self) -> &[u8; STATE_BYTES] {
        &self.plaintext
    }

    /// Cache line index of the first-round lookup for one state byte.
    fn line_index(&self, position: usize) -> i32 {
        ((self.key[position] ^ self.plaintext[position]) >> LINE_SHIFT) as i32
    }

    /// Returns the bit-vector of plausible relative cache line distances for
    /// the lookups into `table`.
    ///
    /// # Panics
    /// Panics if `table >= TABLE_COUNT`.
    pub fn expected_state_bitvector(&self, table: usize) -> StateBitvector {
        let positions = &TABLE_POSITIONS[table];

        let anchor = self.line_index(positions[0]);
        StateBitvector::from_distances(
            positions[1..]
                .iter()
                .map(|&position| self.line_index(position) - anchor),
        )
    }
}
