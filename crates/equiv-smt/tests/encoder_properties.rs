//! Encoder properties over generated programs; no solver needed.

use equiv_ir::proptest_generators::arb_straight_line_program;
use equiv_ir::Var;
use equiv_smt::backends::smtlib_printer::to_smtlib;
use equiv_smt::encode_program;
use equiv_smt::sexp::parse_all;
use proptest::prelude::*;

proptest! {
    #[test]
    fn straight_line_programs_encode_to_balanced_terms(program in arb_straight_line_program()) {
        let enc = encode_program(&program).expect("acyclic");
        prop_assert_eq!(&enc.order, &vec![program.entry]);
        prop_assert!(enc.reach.contains_key(&program.entry));
        prop_assert!(enc.asserts.is_empty());
        prop_assert!(enc.symbol_at_exit(program.entry, &Var::int("out")).is_some());
        for term in &enc.assertions {
            let parsed = parse_all(&to_smtlib(term)).expect("balanced");
            prop_assert_eq!(parsed.len(), 1);
        }
    }
}
