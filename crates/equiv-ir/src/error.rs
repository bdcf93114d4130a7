use thiserror::Error;

use crate::program::{BlockId, CmdPointer};

/// Errors raised by IR construction and analyses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IrError {
    #[error("program has no blocks")]
    Empty,
    #[error("unknown block {0}")]
    UnknownBlock(BlockId),
    #[error("jump or branch at {0} is not the last command of its block")]
    MisplacedTerminator(CmdPointer),
    #[error("program `{0}` is cyclic where an acyclic program is required")]
    Cyclic(String),
}
