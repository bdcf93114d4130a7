//! Identifiers for pieces of program state and for natural loops.

use std::collections::BTreeSet;
use std::fmt;

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::expr::{Expr, Var};
use crate::program::{BlockId, Cmd};

/// One scalar piece of program state: a stack variable or a word of memory
/// at a statically known offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProgramValueLocation {
    MemoryCell(BigInt),
    StackVar(Var),
}

impl ProgramValueLocation {
    /// Commands that read this location into `dst`.
    pub fn read_into(&self, dst: &Var) -> Cmd {
        match self {
            ProgramValueLocation::MemoryCell(offset) => Cmd::MemLoad {
                lhs: dst.clone(),
                offset: Expr::Int(offset.clone()),
            },
            ProgramValueLocation::StackVar(v) => Cmd::assign(dst, Expr::var(v)),
        }
    }

    /// Command that writes `value` into this location.
    pub fn write(&self, value: Expr) -> Cmd {
        match self {
            ProgramValueLocation::MemoryCell(offset) => Cmd::MemStore {
                offset: Expr::Int(offset.clone()),
                value,
            },
            ProgramValueLocation::StackVar(v) => Cmd::assign(v, value),
        }
    }

    pub fn as_var(&self) -> Option<&Var> {
        match self {
            ProgramValueLocation::StackVar(v) => Some(v),
            ProgramValueLocation::MemoryCell(_) => None,
        }
    }
}

impl fmt::Display for ProgramValueLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramValueLocation::MemoryCell(offset) => write!(f, "mem[{offset}]"),
            ProgramValueLocation::StackVar(v) => write!(f, "{v}"),
        }
    }
}

/// A natural loop: `head` dominates every block of `body` (which includes the head).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Loop {
    pub head: BlockId,
    pub body: BTreeSet<BlockId>,
}

impl Loop {
    pub fn contains(&self, block: BlockId) -> bool {
        self.body.contains(&block)
    }
}
