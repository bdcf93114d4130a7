//! Proptest strategies for generating equivalence-checking inputs.

use proptest::prelude::*;

use crate::expr::{Expr, Var};
use crate::program::{BlockId, Cmd, EventKind, Program, ProgramBuilder};

/// A sequence of word writes into a buffer of `length_words` words that
/// is then logged as one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferScript {
    pub length_words: usize,
    /// Word index of every write, in program order.
    pub writes: Vec<usize>,
}

impl BufferScript {
    pub fn length_bytes(&self) -> usize {
        self.length_words * 32
    }

    /// Byte offsets of the writes, relative to the buffer start.
    pub fn relative_offsets(&self) -> Vec<usize> {
        self.writes.iter().map(|w| w * 32).collect()
    }

    /// Index (into `writes`) of the last write of every word.
    pub fn latest_writers(&self) -> Vec<usize> {
        (0..self.length_words)
            .map(|word| {
                self.writes
                    .iter()
                    .rposition(|w| *w == word)
                    .unwrap_or(usize::MAX)
            })
            .collect()
    }

    /// Program writing `value{i}` at `base + 32 * writes[i]` and logging the
    /// buffer `[base, base + length)`. The buffer base is a parameter and the
    /// length flows through a variable, so neither is syntactically constant.
    pub fn to_program(&self, name: &str) -> Program {
        let base = Var::int("base");
        let len = Var::int("len");
        let mut b = ProgramBuilder::new(name);
        let entry = b.new_block();
        b.param(base.clone());
        for (i, word) in self.writes.iter().enumerate() {
            let value = Var::int(format!("value{i}"));
            b.param(value.clone());
            b.push(
                entry,
                Cmd::MemStore {
                    offset: Expr::var(&base).add(Expr::int(*word as u64 * 32)),
                    value: Expr::var(&value),
                },
            );
        }
        b.push(entry, Cmd::assign(&len, Expr::int(self.length_bytes() as u64)));
        b.push(
            entry,
            Cmd::Event {
                kind: EventKind::Log,
                offset: Expr::var(&base),
                length: Expr::var(&len),
                context: Vec::new(),
            },
        );
        b.push(entry, Cmd::Return {
            payload: crate::program::ExitPayload::Values(Vec::new()),
        });
        match b.build() {
            Ok(p) => p,
            Err(e) => panic!("generated buffer program is malformed: {e}"),
        }
    }
}

/// Strategy for buffer scripts whose writes cover every word at least once.
/// Extra (possibly overlapping) writes are prepended.
pub fn arb_buffer_script() -> impl Strategy<Value = BufferScript> {
    (1..=5usize)
        .prop_flat_map(|length_words| {
            (
                Just(length_words),
                proptest::collection::vec(0..length_words, 0..4),
                Just((0..length_words).collect::<Vec<_>>()).prop_shuffle(),
            )
        })
        .prop_map(|(length_words, mut prefix, covering)| {
            prefix.extend(covering);
            BufferScript {
                length_words,
                writes: prefix,
            }
        })
}

/// Strategy for small straight-line arithmetic programs over two parameters,
/// returning one value.
pub fn arb_straight_line_program() -> impl Strategy<Value = Program> {
    proptest::collection::vec((0..3u8, -5i64..5), 1..6).prop_map(|ops| {
        let x = Var::int("x");
        let y = Var::int("y");
        let mut b = ProgramBuilder::new("straight");
        let entry: BlockId = b.new_block();
        b.param(x.clone()).param(y.clone());
        let mut acc = Expr::var(&x);
        for (op, k) in ops {
            acc = match op {
                0 => acc.add(Expr::int(k)),
                1 => acc.sub(Expr::var(&y)),
                _ => acc.mul(Expr::int(k)),
            };
        }
        let out = Var::int("out");
        b.push(entry, Cmd::assign(&out, acc));
        b.push(entry, Cmd::Return {
            payload: crate::program::ExitPayload::Values(vec![Expr::var(&out)]),
        });
        match b.build() {
            Ok(p) => p,
            Err(e) => panic!("generated program is malformed: {e}"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn buffer_scripts_cover_every_word(script in arb_buffer_script()) {
            let writers = script.latest_writers();
            prop_assert!(writers.iter().all(|w| *w < script.writes.len()));
            let program = script.to_program("buf");
            prop_assert!(program.validate().is_ok());
        }

        #[test]
        fn generated_programs_survive_json(program in arb_straight_line_program()) {
            let json = serde_json::to_string(&program).expect("serializes");
            let back: Program = serde_json::from_str(&json).expect("parses");
            prop_assert_eq!(back, program);
        }
    }
}
