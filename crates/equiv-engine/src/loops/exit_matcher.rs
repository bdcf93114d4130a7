//! Matching the exit sites of two iteration programs.
//!
//! For every exit site of A the matcher finds the exit sites of B that can
//! be taken when A leaves through it. Each query forces A through one site
//! and turns the exits of B in a range into labelled failing assertions; a
//! model names one reachable B site, and the ranges on either side of it
//! are searched in parallel. Timeouts split the range in half. The first
//! inconclusive answer cancels the whole search.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use equiv_ir::patch::Patcher;
use equiv_ir::{AssertMeta, AssertTag, Cmd, CmdPointer, Expr, Program};
use equiv_smt::{ProgramVerifier, Verdict};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::rule_generator::{vc_program, CallingConvention, RuleGenerator};

/// For each exit site of A, the exit sites of B compatible with it.
pub type ExitMatching = Vec<(CmdPointer, Vec<CmdPointer>)>;

#[derive(Debug, Clone, Default)]
struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
enum SearchFailure {
    Cancelled,
    Inconclusive(String),
    Engine(EngineError),
}

impl From<EngineError> for SearchFailure {
    fn from(e: EngineError) -> Self {
        SearchFailure::Engine(e)
    }
}

type SearchResult<T> = Result<T, SearchFailure>;

struct ExitMatcher<'m> {
    verifier: &'m dyn ProgramVerifier,
    rules: RuleGenerator<&'m dyn CallingConvention>,
    label: &'m str,
    token: CancellationToken,
    /// B with every exit replaced by its labelled assertion.
    b_labelled: Program,
    b_exits: Vec<CmdPointer>,
}

impl ExitMatcher<'_> {
    fn exit_search(&self, a_site: usize, a_selected: &Program, range: Range<usize>) -> SearchResult<Vec<CmdPointer>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        if self.token.is_cancelled() {
            return Err(SearchFailure::Cancelled);
        }
        let mut patcher = Patcher::new(self.b_labelled.clone());
        for (ind, ptr) in self.b_exits.iter().enumerate() {
            if !range.contains(&ind) {
                patcher.replace_command(*ptr, vec![Cmd::assume(Expr::ff())]);
            }
        }
        let b = patcher.finish();
        let name = format!("{}-exit-match-A{a_site}-B{}_{}", self.label, range.start, range.end);
        let rule = self
            .rules
            .generate_rule(a_selected, &b, &vc_program("and done", vec![Cmd::label("and done")]), &name)?;
        let verdict = self.verifier.verify(&rule, &name).map_err(EngineError::from)?;
        debug!(rule = %name, verdict = verdict.name(), "exit search");
        match verdict {
            Verdict::Unsat => Ok(Vec::new()),
            Verdict::Timeout if range.len() > 1 => {
                let mid = range.start + range.len() / 2;
                self.search_both(a_site, a_selected, range.start..mid, mid..range.end)
                    .map(|(mut left, right)| {
                        left.extend(right);
                        left
                    })
            }
            Verdict::Timeout => Err(SearchFailure::Inconclusive(format!(
                "timeout on exit {} of B for exit {a_site} of A",
                range.start
            ))),
            Verdict::Sat(model) => {
                let hit = model.failed_asserts().iter().find_map(|f| match f.meta.tag {
                    Some(AssertTag::ExitSite(id)) => Some(id),
                    _ => None,
                });
                let Some(id) = hit else {
                    return Err(EngineError::Invariant(
                        "Failed VC but didn't find labelled failing assert".to_string(),
                    )
                    .into());
                };
                let Some(found) = self.b_exits.get(id).filter(|_| range.contains(&id)) else {
                    return Err(EngineError::Invariant(format!("exit {id} of B is outside {range:?}")).into());
                };
                let (left, right) = self.search_both(a_site, a_selected, range.start..id, id + 1..range.end)?;
                let mut out = vec![*found];
                out.extend(left);
                out.extend(right);
                Ok(out)
            }
            other => Err(SearchFailure::Inconclusive(format!(
                "Failed to match exits for {name}: {}",
                other.name()
            ))),
        }
    }

    fn search_both(
        &self,
        a_site: usize,
        a_selected: &Program,
        left: Range<usize>,
        right: Range<usize>,
    ) -> SearchResult<(Vec<CmdPointer>, Vec<CmdPointer>)> {
        std::thread::scope(|s| {
            let handle = s.spawn(|| self.exit_search(a_site, a_selected, left));
            let right = self.exit_search(a_site, a_selected, right);
            let left = handle
                .join()
                .map_err(|_| SearchFailure::Inconclusive("exit search panicked".to_string()))?;
            Ok((left?, right?))
        })
    }

    /// Matches of the `a_site`-th exit of A.
    fn match_site(&self, a: &Program, a_exits: &[CmdPointer], a_site: usize) -> SearchResult<Vec<CmdPointer>> {
        let mut patcher = Patcher::new(a.clone());
        for (ind, ptr) in a_exits.iter().enumerate() {
            if ind == a_site {
                continue;
            }
            patcher.replace_command(*ptr, vec![Cmd::assume(Expr::ff())]);
        }
        let a_selected = patcher.finish();
        let result = self.exit_search(a_site, &a_selected, 0..self.b_exits.len());
        if result.is_err() {
            self.token.cancel();
        }
        result
    }
}

/// Replace every exit of `b` by a failing assertion tagged with its index.
fn label_exits(b: &Program, exits: &[CmdPointer]) -> Program {
    let mut patcher = Patcher::new(b.clone());
    for (id, ptr) in exits.iter().enumerate() {
        patcher.replace_command(
            *ptr,
            vec![Cmd::Assert {
                cond: Expr::ff(),
                msg: format!("exit site {id}"),
                meta: AssertMeta::tagged(AssertTag::ExitSite(id)),
            }],
        );
    }
    patcher.finish()
}

/// Match the exit sites of `a` with those of `b`. `None` when some query
/// was inconclusive.
pub fn match_exits(
    verifier: &dyn ProgramVerifier,
    convention: &dyn CallingConvention,
    label: &str,
    a: &Program,
    b: &Program,
) -> EngineResult<Option<ExitMatching>> {
    let a_exits = a.halting_sites();
    let b_exits = b.halting_sites();
    let matcher = ExitMatcher {
        verifier,
        rules: RuleGenerator::new(convention),
        label,
        token: CancellationToken::default(),
        b_labelled: label_exits(b, &b_exits),
        b_exits,
    };
    let results: Vec<SearchResult<Vec<CmdPointer>>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..a_exits.len())
            .map(|site| {
                let matcher = &matcher;
                let a_exits = &a_exits;
                s.spawn(move || matcher.match_site(a, a_exits, site))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(SearchFailure::Inconclusive("exit match panicked".to_string())))
            })
            .collect()
    });

    let mut matching = ExitMatching::new();
    let mut inconclusive = None;
    for (site, result) in a_exits.iter().zip(results) {
        match result {
            Ok(found) => matching.push((*site, found)),
            Err(SearchFailure::Engine(e)) => return Err(e),
            Err(SearchFailure::Inconclusive(why)) => inconclusive = Some(why),
            Err(SearchFailure::Cancelled) => {}
        }
    }
    if let Some(why) = inconclusive {
        warn!(label, why, "exit matching failed");
        return Ok(None);
    }
    Ok(Some(matching))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule_generator::StandardConvention;
    use equiv_ir::{BlockId, ExitPayload, ProgramBuilder, Var};
    use equiv_smt::{FailedAssert, ProgramModel, VerifyError};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// `if (x < 0) return 0 else return 1`
    fn two_exits(name: &str) -> Program {
        let x = Var::int("x");
        let mut b = ProgramBuilder::new(name);
        let entry = b.new_block();
        let neg = b.new_block();
        let pos = b.new_block();
        b.param(x.clone());
        b.push(entry, Cmd::branch(Expr::var(&x).lt(Expr::int(0)), neg, pos));
        b.push(neg, Cmd::Return { payload: ExitPayload::Values(vec![Expr::int(0)]) });
        b.push(pos, Cmd::Return { payload: ExitPayload::Values(vec![Expr::int(1)]) });
        b.build().expect("well formed")
    }

    /// Reports the labelled exit of B that shares its block with the
    /// selected exit of A, as a solver would for these programs.
    struct SameBranch {
        queries: Mutex<usize>,
    }

    impl ProgramVerifier for SameBranch {
        fn verify(&self, rule: &Program, _name: &str) -> Result<Verdict, VerifyError> {
            *self.queries.lock().expect("lock") += 1;
            // A's selected exit is the Return left in A's blocks
            let selected = rule
                .commands()
                .find(|(ptr, cmd)| ptr.block.call == 1 && matches!(cmd, Cmd::Return { .. }))
                .map(|(ptr, _)| ptr.block.id);
            let labelled = rule.commands().find_map(|(ptr, cmd)| match cmd {
                Cmd::Assert { meta, .. } if ptr.block.call == 2 && Some(ptr.block.id) == selected => {
                    Some((ptr, meta.clone()))
                }
                _ => None,
            });
            Ok(match labelled {
                Some((ptr, meta)) => Verdict::Sat(ProgramModel::new(
                    HashMap::new(),
                    HashSet::new(),
                    vec![FailedAssert {
                        ptr,
                        msg: "exit".to_string(),
                        meta,
                    }],
                )),
                None => Verdict::Unsat,
            })
        }
    }

    #[test]
    fn each_exit_matches_its_counterpart() {
        let a = two_exits("a");
        let b = two_exits("b");
        let verifier = SameBranch { queries: Mutex::new(0) };
        let matching = match_exits(&verifier, &StandardConvention, "t", &a, &b)
            .expect("no engine error")
            .expect("conclusive");
        let neg = CmdPointer::new(BlockId::new(1), 0);
        let pos = CmdPointer::new(BlockId::new(2), 0);
        assert_eq!(matching, vec![(neg, vec![neg]), (pos, vec![pos])]);
        // per site: the hit, then one query for the non-empty remainder
        assert_eq!(*verifier.queries.lock().expect("lock"), 4);
    }

    struct AlwaysUnknown;

    impl ProgramVerifier for AlwaysUnknown {
        fn verify(&self, _rule: &Program, _name: &str) -> Result<Verdict, VerifyError> {
            Ok(Verdict::Unknown("no idea".to_string()))
        }
    }

    #[test]
    fn inconclusive_answers_abandon_the_matching() {
        let a = two_exits("a");
        let b = two_exits("b");
        let matching = match_exits(&AlwaysUnknown, &StandardConvention, "t", &a, &b).expect("no engine error");
        assert!(matching.is_none());
    }

    #[test]
    fn labels_carry_exit_indices() {
        let b = two_exits("b");
        let exits = b.halting_sites();
        let labelled = label_exits(&b, &exits);
        match labelled.cmd(exits[1]) {
            Some(Cmd::Assert { meta, .. }) => assert_eq!(meta.tag, Some(AssertTag::ExitSite(1))),
            other => panic!("Expected labelled assert, got: {other:?}"),
        }
    }
}
