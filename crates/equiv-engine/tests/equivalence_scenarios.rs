mod common;

use common::{
    add_constant, count_to_n, init_tracing, logging, missing_in_b, pairs_same_names, silent,
    two_counters, two_counters_by_j, zero_holders, Always, Modelled,
};
use equiv_engine::explain::MismatchExplanation;
use equiv_engine::{check_equivalence, EquivalenceOptions, ReportOutcome};
use equiv_ir::graph::is_acyclic;
use equiv_smt::{ProgramModel, Verdict};

#[test]
fn unsat_everywhere_proves_loop_free_programs_equivalent() {
    init_tracing();
    let verifier = Always::unsat();
    let report = check_equivalence(
        &add_constant("a", 1),
        &add_constant("b", 1),
        &EquivalenceOptions::default(),
        &verifier,
    )
    .expect("no engine error");
    assert!(report.is_equivalent());
    let rules: Vec<&str> = report.checks.iter().map(|c| c.rule.as_str()).collect();
    assert_eq!(rules, ["calls-unified", "logs-unified", "exits-unified"]);
    assert_eq!(verifier.rules(), ["calls-unified", "logs-unified", "exits-unified"]);
    assert!(report.summarized_loops.is_empty());
    assert!(!report.unrolled_loops);
    assert!(report.refinements.is_empty());
}

#[test]
fn programs_with_events_follow_the_same_sequence() {
    let verifier = Always::unsat();
    let report = check_equivalence(
        &logging("a"),
        &logging("b"),
        &EquivalenceOptions::default(),
        &verifier,
    )
    .expect("no engine error");
    assert!(report.is_equivalent());
    assert_eq!(report.checks.len(), 3);
}

#[test]
fn timeouts_exhaust_the_strategy() {
    let verifier = Always::new(Verdict::Timeout);
    let report = check_equivalence(
        &add_constant("a", 1),
        &add_constant("b", 2),
        &EquivalenceOptions::default(),
        &verifier,
    )
    .expect("no engine error");
    assert_eq!(
        report.outcome,
        ReportOutcome::Inconclusive {
            reason: "timeout".to_string()
        }
    );
    assert_eq!(verifier.rules(), ["calls-unified", "calls-tier-0"]);
}

#[test]
fn unknown_answers_are_inconclusive() {
    let verifier = Always::new(Verdict::Unknown("incomplete".to_string()));
    let report = check_equivalence(
        &add_constant("a", 1),
        &add_constant("b", 1),
        &EquivalenceOptions::default(),
        &verifier,
    )
    .expect("no engine error");
    match report.outcome {
        ReportOutcome::Inconclusive { reason } => {
            assert!(reason.starts_with("unexpected solver response"), "{reason}");
        }
        other => panic!("Expected inconclusive, got: {other:?}"),
    }
    assert_eq!(report.checks.len(), 1);
}

#[test]
fn models_without_a_tagged_failure_are_inconclusive() {
    let verifier = Always::new(Verdict::Sat(ProgramModel::default()));
    let report = check_equivalence(
        &add_constant("a", 1),
        &add_constant("b", 2),
        &EquivalenceOptions::default(),
        &verifier,
    )
    .expect("no engine error");
    assert_eq!(
        report.outcome,
        ReportOutcome::Inconclusive {
            reason: "Couldn't find failing assertion in counterexample".to_string()
        }
    );
}

#[test]
fn counting_loops_are_summarized_before_checking() {
    init_tracing();
    let verifier = Always::unsat();
    let report = check_equivalence(
        &count_to_n("a"),
        &count_to_n("b"),
        &EquivalenceOptions::default(),
        &verifier,
    )
    .expect("no engine error");
    assert!(report.is_equivalent());
    assert_eq!(report.summarized_loops.len(), 1);
    assert_eq!(report.summarized_loops[0].outputs, 1);
    assert!(!report.unrolled_loops);
    let rules = verifier.rules();
    assert!(rules.iter().any(|r| r.contains("exit-match")), "{rules:?}");
    assert!(rules.ends_with(&[
        "calls-unified".to_string(),
        "logs-unified".to_string(),
        "exits-unified".to_string()
    ]));
}

#[test]
fn loops_are_unrolled_without_summarization() {
    let options = EquivalenceOptions {
        summarize_loops: false,
        ..EquivalenceOptions::default()
    };
    let verifier = Always::unsat();
    let report = check_equivalence(&count_to_n("a"), &count_to_n("b"), &options, &verifier)
        .expect("no engine error");
    assert!(report.summarized_loops.is_empty());
    assert!(report.unrolled_loops);
    assert!(report.is_equivalent());
}

#[test]
fn summarized_programs_are_acyclic_and_stable() {
    use equiv_engine::equivalence::EquivalenceLimits;
    use equiv_engine::instrumentation::TraceInstrumenter;
    use equiv_engine::loops::config::extract_primary_loop;
    use equiv_engine::loops::LoopSummarizer;

    let verifier = Always::unsat();
    let instrumenter = TraceInstrumenter;
    let mut summarizer = LoopSummarizer::new(&verifier, &instrumenter, EquivalenceLimits::default());
    let (a, b) = summarizer
        .try_summarize_loops(count_to_n("p"), count_to_n("p"))
        .expect("no engine error");
    assert_eq!(summarizer.summarized().len(), 1);
    assert!(is_acyclic(&a) && is_acyclic(&b));
    assert_eq!(a, b);
    assert!(extract_primary_loop(&a).is_none());
    assert!(a.block(summarizer.summarized()[0].a_head).is_err());

    let mut again = LoopSummarizer::new(&verifier, &instrumenter, EquivalenceLimits::default());
    let (a2, b2) = again.try_summarize_loops(a.clone(), b.clone()).expect("no engine error");
    assert!(again.summarized().is_empty());
    assert_eq!(a2, a);
    assert_eq!(b2, b);
}

#[test]
fn report_files_are_written() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("report.html");
    let options = EquivalenceOptions {
        report: Some(path.clone()),
        ..EquivalenceOptions::default()
    };
    let report = check_equivalence(&add_constant("a", 1), &add_constant("b", 1), &options, &Always::unsat())
        .expect("no engine error");
    let html = std::fs::read_to_string(&path).expect("report written");
    assert!(html.contains("<h1>equivalent</h1>"));
    assert!(html.contains(&report.a.sha256));
    assert_eq!(report.a.sha256.len(), 64);
    assert_ne!(report.a.sha256, report.b.sha256);
}

#[test]
fn paired_counters_are_deleted_together() {
    let verifier = Always::unsat();
    let report = check_equivalence(
        &two_counters("a"),
        &two_counters("b"),
        &EquivalenceOptions::default(),
        &verifier,
    )
    .expect("no engine error");
    assert!(report.is_equivalent());
    assert_eq!(report.summarized_loops.len(), 1);
    assert_eq!(report.summarized_loops[0].inputs, 2);
    assert!(!report.unrolled_loops);
}

#[test]
fn an_extra_log_is_missing_on_the_other_side() {
    let verifier = Modelled::new(|rule, name| match name {
        "logs-unified" => missing_in_b(rule),
        _ => Verdict::Unsat,
    });
    let report = check_equivalence(
        &logging("a"),
        &silent("b"),
        &EquivalenceOptions::default(),
        &verifier,
    )
    .expect("no engine error");
    let ReportOutcome::NotEquivalent { counterexample } = &report.outcome else {
        panic!("Expected a counterexample, got: {:?}", report.outcome);
    };
    match &counterexample.mismatch {
        MismatchExplanation::MissingInB { event_in_a } => {
            assert_eq!(event_in_a.kind, "log");
            assert_eq!(event_in_a.index.as_deref(), Some("0"));
        }
        other => panic!("Expected the event to be missing in B, got: {other:?}"),
    }
    assert_eq!(report.refinements.len(), 1);
    assert_eq!(report.refinements[0].kind, "unrefinable");
    let rules = verifier.rules();
    assert!(
        rules.ends_with(&[
            "calls-unified".to_string(),
            "logs-unified".to_string(),
            "logs-unified-min-0".to_string()
        ]),
        "{rules:?}"
    );
}

#[test]
fn crossed_counter_pairing_is_rejected() {
    let verifier = Modelled::new(|rule, name| {
        if !name.contains("-inputs-") {
            return Verdict::Unsat;
        }
        match pairs_same_names(rule) {
            Some(true) => Verdict::Unsat,
            _ => zero_holders(rule),
        }
    });
    let report = check_equivalence(
        &two_counters("a"),
        &two_counters_by_j("b"),
        &EquivalenceOptions::default(),
        &verifier,
    )
    .expect("no engine error");
    assert!(report.is_equivalent());
    assert_eq!(report.summarized_loops.len(), 1);
    assert_eq!(report.summarized_loops[0].inputs, 2);
    let pairing: Vec<String> = verifier
        .rules()
        .into_iter()
        .filter(|r| r.contains("-inputs-"))
        .collect();
    // the identity pairing crosses i with j; the second attempt is accepted
    assert_eq!(pairing.len(), 2, "{pairing:?}");
}
