//! Static classification of trace sites under an [`InclusionMode`].

use std::collections::HashMap;

use equiv_ir::graph::topological_order;
use equiv_ir::{CmdPointer, Program};
use indexmap::IndexMap;

use super::{InclusionMode, InclusionSort, SiteKind, TraceTarget};

/// Number of target events that may precede a site: `lo..=hi`, `hi = None`
/// when unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventInterval {
    pub lo: u32,
    pub hi: Option<u32>,
}

impl EventInterval {
    fn exact(n: u32) -> Self {
        Self { lo: n, hi: Some(n) }
    }

    fn join(self, other: Self) -> Self {
        Self {
            lo: self.lo.min(other.lo),
            hi: match (self.hi, other.hi) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            },
        }
    }

    fn bump(self) -> Self {
        Self {
            lo: self.lo.saturating_add(1),
            hi: self.hi.map(|h| h.saturating_add(1)),
        }
    }
}

/// Intervals of every target site. Cyclic programs get unbounded intervals.
pub fn event_intervals(
    program: &Program,
    sites: &IndexMap<CmdPointer, (u32, SiteKind)>,
    target: TraceTarget,
) -> HashMap<CmdPointer, EventInterval> {
    let is_target = |ptr: &CmdPointer| {
        sites
            .get(ptr)
            .is_some_and(|(_, kind)| target.matches(kind))
    };
    let mut out = HashMap::new();
    let Ok(order) = topological_order(program) else {
        for ptr in sites.keys().filter(|p| is_target(p)) {
            out.insert(*ptr, EventInterval { lo: 0, hi: None });
        }
        return out;
    };
    let mut at_entry: HashMap<equiv_ir::BlockId, EventInterval> = HashMap::new();
    at_entry.insert(program.entry, EventInterval::exact(0));
    for b in order {
        let Some(mut current) = at_entry.get(&b).copied() else {
            continue;
        };
        let Some(block) = program.blocks.get(&b) else {
            continue;
        };
        for pos in 0..block.cmds.len() {
            let ptr = CmdPointer::new(b, pos);
            if is_target(&ptr) {
                out.insert(ptr, current);
                current = current.bump();
            }
        }
        for succ in block.successors() {
            let joined = match at_entry.get(&succ) {
                Some(prev) => prev.join(current),
                None => current,
            };
            at_entry.insert(succ, joined);
        }
    }
    out
}

/// What the instrumentation does at one target site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteAction {
    /// Count the event without recording it.
    Count,
    /// Record the event; with `only_at` it is recorded only at that position.
    Record {
        only_at: Option<u32>,
        stop_after: bool,
    },
    /// A non-target site after which the program stops.
    StopAfter,
    /// The site cannot be reached in this query.
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SitePlan {
    pub action: SiteAction,
    pub sort: InclusionSort,
}

/// Plan for every target site, plus non-target sites named by
/// `UntilExactly` (which stop the program) and halting sites it blocks.
pub fn plan_sites(
    program: &Program,
    sites: &IndexMap<CmdPointer, (u32, SiteKind)>,
    target: TraceTarget,
    mode: &InclusionMode,
) -> HashMap<CmdPointer, SitePlan> {
    let mut plans = HashMap::new();
    match mode {
        InclusionMode::Unified => {
            for (ptr, (_, kind)) in sites {
                if target.matches(kind) {
                    plans.insert(
                        *ptr,
                        SitePlan {
                            action: SiteAction::Record {
                                only_at: None,
                                stop_after: false,
                            },
                            sort: InclusionSort::MaybeIncluded,
                        },
                    );
                }
            }
        }
        InclusionMode::Until(n) => {
            let n = *n;
            for (ptr, iv) in event_intervals(program, sites, target) {
                let halting = sites.get(&ptr).is_some_and(|(_, k)| k.is_exit());
                let plan = if iv.hi.is_some_and(|h| h < n) {
                    SitePlan {
                        action: SiteAction::Count,
                        sort: InclusionSort::DefinitelyExcluded,
                    }
                } else if iv.lo > n {
                    SitePlan {
                        action: SiteAction::Block,
                        sort: InclusionSort::DefinitelyExcluded,
                    }
                } else if iv.lo == n && iv.hi == Some(n) {
                    SitePlan {
                        action: SiteAction::Record {
                            only_at: None,
                            stop_after: !halting,
                        },
                        sort: InclusionSort::DefinitelyIncluded,
                    }
                } else {
                    SitePlan {
                        action: SiteAction::Record {
                            only_at: Some(n),
                            stop_after: !halting,
                        },
                        sort: InclusionSort::MaybeIncluded,
                    }
                };
                plans.insert(ptr, plan);
            }
        }
        InclusionMode::UntilExactly(chosen) => {
            for (ptr, (_, kind)) in sites {
                let listed = chosen.contains(ptr);
                let halting = kind.is_exit();
                let plan = match (target.matches(kind), listed) {
                    (true, true) => SitePlan {
                        action: SiteAction::Record {
                            only_at: None,
                            stop_after: !halting,
                        },
                        sort: InclusionSort::DefinitelyIncluded,
                    },
                    (true, false) => SitePlan {
                        action: if halting {
                            SiteAction::Block
                        } else {
                            SiteAction::Count
                        },
                        sort: InclusionSort::DefinitelyExcluded,
                    },
                    (false, true) if !halting => SitePlan {
                        action: SiteAction::StopAfter,
                        sort: InclusionSort::DefinitelyExcluded,
                    },
                    (false, false) if halting => SitePlan {
                        action: SiteAction::Block,
                        sort: InclusionSort::DefinitelyExcluded,
                    },
                    _ => continue,
                };
                plans.insert(*ptr, plan);
            }
        }
    }
    plans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentation::number_sites;
    use equiv_ir::{Cmd, EventKind, Expr, ProgramBuilder, Var};

    fn log() -> Cmd {
        Cmd::Event {
            kind: EventKind::Log,
            offset: Expr::int(0),
            length: Expr::int(0),
            context: vec![],
        }
    }

    /// entry: log; branch { left: log } join: log; return
    fn diamond() -> Program {
        let c = Var::bool("c");
        let mut b = ProgramBuilder::new("diamond");
        let entry = b.new_block();
        let left = b.new_block();
        let join = b.new_block();
        b.push(entry, log());
        b.push(entry, Cmd::branch(Expr::var(&c), left, join));
        b.push(left, log());
        b.push(left, Cmd::jump(join));
        b.push(join, log());
        b.push(join, Cmd::Return { payload: equiv_ir::ExitPayload::Values(vec![]) });
        b.build().expect("well formed")
    }

    #[test]
    fn intervals_join_over_branches() {
        let p = diamond();
        let sites = number_sites(&p);
        let iv = event_intervals(&p, &sites, TraceTarget::Log);
        assert_eq!(iv[&CmdPointer::new(p.entry, 0)], EventInterval::exact(0));
        assert_eq!(iv[&CmdPointer::new(equiv_ir::BlockId::new(1), 0)], EventInterval::exact(1));
        assert_eq!(
            iv[&CmdPointer::new(equiv_ir::BlockId::new(2), 0)],
            EventInterval { lo: 1, hi: Some(2) }
        );
    }

    #[test]
    fn until_classifies_before_at_and_after() {
        let p = diamond();
        let sites = number_sites(&p);
        let plans = plan_sites(&p, &sites, TraceTarget::Log, &InclusionMode::Until(1));
        let first = plans[&CmdPointer::new(p.entry, 0)];
        assert_eq!(first.action, SiteAction::Count);
        assert_eq!(first.sort, InclusionSort::DefinitelyExcluded);
        let left = plans[&CmdPointer::new(equiv_ir::BlockId::new(1), 0)];
        assert_eq!(left.sort, InclusionSort::DefinitelyIncluded);
        let join = plans[&CmdPointer::new(equiv_ir::BlockId::new(2), 0)];
        assert_eq!(join.sort, InclusionSort::MaybeIncluded);
        match join.action {
            SiteAction::Record { only_at, .. } => assert_eq!(only_at, Some(1)),
            other => panic!("Expected Record, got: {other:?}"),
        }

        let beyond = plan_sites(&p, &sites, TraceTarget::Log, &InclusionMode::Until(3));
        assert!(beyond
            .values()
            .all(|plan| plan.sort == InclusionSort::DefinitelyExcluded));
    }
}
