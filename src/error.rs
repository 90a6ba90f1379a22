use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A log line matched one of the recognized marker shapes but one of its
    /// fields could not be parsed or is out of range.
    #[error("malformed log line {line_number}: {reason}: {line:?}")]
    MalformedLine {
        line_number: usize,
        reason: String,
        line: String,
    },
    #[error("state line {line_number} appears before any experiment marker")]
    StateBeforeMarker { line_number: usize },
    #[error("dependent marker on line {line_number} appears before any anchor marker")]
    DependentBeforeAnchor { line_number: usize },
    /// An experiment group with no observed states. This indicates a defect in
    /// the capture run, not a zero match ratio.
    #[error("experiment group {index} contains no observed states")]
    EmptyGroup { index: usize },
    #[error("found only {found} qualifying load instructions in the disassembly, expected {expected}")]
    NotEnoughLoads { found: usize, expected: usize },
    #[error("padding before {label} is {bytes} bytes, not a whole number of instructions")]
    PaddingAlignment { label: String, bytes: u64 },
    #[error("failed to serialize report")]
    SerializeError(#[from] serde_json::Error),
    #[error(transparent)]
    IoError(#[from] io::Error),
}
