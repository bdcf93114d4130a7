//! Write-history tracking for buffers read at tracked use sites.
//!
//! The buffer `[base, base + len)` is not known before the use site, so
//! `base` and `len` are prophecy variables: havocked at entry and pinned to
//! the site's actual offset and length when the site executes. Every memory
//! write overlapping the prophesied buffer shifts a fixed-size register file
//! (latest write in register 0) and bumps a counter.

use equiv_ir::{Cmd, Expr, Var};

use super::{BufferWrites, WriteRegister};

/// A memory write as seen by the tracker.
#[derive(Debug, Clone)]
pub(super) struct WriteEvent {
    pub offset: Expr,
    pub length: Expr,
    pub precise: bool,
    /// Copy site id, 0 for word stores.
    pub source: u32,
    pub value: Expr,
}

#[derive(Debug, Clone)]
pub(super) struct TrackedBuffer {
    base: Var,
    len: Var,
    overlaps: Var,
    count: Var,
    reached: Var,
    live: Vec<WriteRegister>,
    snapshot: BufferWrites,
}

fn register(prefix: &str, r: usize, suffix: &str) -> WriteRegister {
    let name = |field: &str| Var::int(format!("{prefix}!r{r}!{field}{suffix}"));
    WriteRegister {
        offset: name("off"),
        length: name("len"),
        precise: name("prec"),
        source: name("src"),
        value: name("val"),
    }
}

fn fields(r: &WriteRegister) -> [&Var; 5] {
    [&r.offset, &r.length, &r.precise, &r.source, &r.value]
}

impl TrackedBuffer {
    pub fn new(site: u32, capacity: usize) -> Self {
        let prefix = format!("wt!{site}");
        let capacity = capacity.max(1);
        Self {
            base: Var::int(format!("{prefix}!base")),
            len: Var::int(format!("{prefix}!len")),
            overlaps: Var::bool(format!("{prefix}!ov")),
            count: Var::int(format!("{prefix}!count")),
            reached: Var::bool(format!("{prefix}!reached")),
            live: (0..capacity).map(|r| register(&prefix, r, "")).collect(),
            snapshot: BufferWrites {
                reached: Var::bool(format!("{prefix}!reached")),
                length: Var::int(format!("{prefix}!len")),
                count: Var::int(format!("{prefix}!count!at")),
                registers: (0..capacity).map(|r| register(&prefix, r, "!at")).collect(),
            },
        }
    }

    pub fn snapshot_vars(&self) -> BufferWrites {
        self.snapshot.clone()
    }

    pub fn init(&self) -> Vec<Cmd> {
        let mut cmds = vec![
            Cmd::Havoc {
                lhs: self.base.clone(),
            },
            Cmd::Havoc {
                lhs: self.len.clone(),
            },
            Cmd::assign(&self.count, Expr::int(0)),
            Cmd::assign(&self.reached, Expr::ff()),
        ];
        for reg in &self.live {
            for f in fields(reg) {
                cmds.push(Cmd::assign(f, Expr::int(0)));
            }
        }
        cmds
    }

    pub fn on_write(&self, write: &WriteEvent) -> Vec<Cmd> {
        let base = Expr::var(&self.base);
        let end = base.clone().add(Expr::var(&self.len));
        let mut cmds = vec![Cmd::assign(
            &self.overlaps,
            Expr::and(vec![
                write.offset.clone().lt(end),
                base.clone()
                    .lt(write.offset.clone().add(write.length.clone())),
            ]),
        )];
        let ov = Expr::var(&self.overlaps);
        let shift = |dst: &Var, src: Expr| {
            Cmd::assign(dst, Expr::ite(ov.clone(), src, Expr::var(dst)))
        };
        for r in (1..self.live.len()).rev() {
            let (older, newer) = (&self.live[r], &self.live[r - 1]);
            for (dst, src) in fields(older).into_iter().zip(fields(newer)) {
                cmds.push(shift(dst, Expr::var(src)));
            }
        }
        let latest = &self.live[0];
        cmds.push(shift(&latest.offset, write.offset.clone().sub(base)));
        cmds.push(shift(&latest.length, write.length.clone()));
        cmds.push(shift(&latest.precise, Expr::int(i32::from(write.precise))));
        cmds.push(shift(&latest.source, Expr::int(write.source)));
        cmds.push(shift(&latest.value, write.value.clone()));
        cmds.push(shift(
            &self.count,
            Expr::var(&self.count).add(Expr::int(1)),
        ));
        cmds
    }

    /// Pin the prophecy to the site's buffer and snapshot the history.
    pub fn at_site(&self, offset: &Expr, length: &Expr) -> Vec<Cmd> {
        let mut cmds = vec![
            Cmd::assume(Expr::and(vec![
                Expr::var(&self.base).eq(offset.clone()),
                Expr::var(&self.len).eq(length.clone()),
            ])),
            Cmd::assign(&self.reached, Expr::tt()),
            Cmd::assign(&self.snapshot.count, Expr::var(&self.count)),
        ];
        for (live, snap) in self.live.iter().zip(&self.snapshot.registers) {
            for (src, dst) in fields(live).into_iter().zip(fields(snap)) {
                cmds.push(Cmd::assign(dst, Expr::var(src)));
            }
        }
        cmds
    }
}
