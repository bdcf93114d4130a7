use num_traits::Signed;

use crate::sorts::SmtSort;
use crate::terms::SmtTerm;

/// Print an SmtTerm as SMT-LIB2 format.
pub fn to_smtlib(term: &SmtTerm) -> String {
    match term {
        SmtTerm::Var(name) => quote_symbol(name),
        SmtTerm::IntLit(n) => {
            if n.is_negative() {
                format!("(- {})", -n)
            } else {
                n.to_string()
            }
        }
        SmtTerm::BoolLit(b) => {
            if *b {
                "true".to_string()
            } else {
                "false".to_string()
            }
        }
        SmtTerm::Add(lhs, rhs) => format!("(+ {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::Sub(lhs, rhs) => format!("(- {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::Mul(lhs, rhs) => format!("(* {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::Div(lhs, rhs) => format!("(div {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::Mod(lhs, rhs) => format!("(mod {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::Eq(lhs, rhs) => format!("(= {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::Lt(lhs, rhs) => format!("(< {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::Le(lhs, rhs) => format!("(<= {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::Gt(lhs, rhs) => format!("(> {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::Ge(lhs, rhs) => format!("(>= {} {})", to_smtlib(lhs), to_smtlib(rhs)),
        SmtTerm::And(terms) => {
            if terms.is_empty() {
                "true".to_string()
            } else if terms.len() == 1 {
                to_smtlib(&terms[0])
            } else {
                let inner: Vec<String> = terms.iter().map(to_smtlib).collect();
                format!("(and {})", inner.join(" "))
            }
        }
        SmtTerm::Or(terms) => {
            if terms.is_empty() {
                "false".to_string()
            } else if terms.len() == 1 {
                to_smtlib(&terms[0])
            } else {
                let inner: Vec<String> = terms.iter().map(to_smtlib).collect();
                format!("(or {})", inner.join(" "))
            }
        }
        SmtTerm::Not(inner) => format!("(not {})", to_smtlib(inner)),
        SmtTerm::Implies(lhs, rhs) => {
            format!("(=> {} {})", to_smtlib(lhs), to_smtlib(rhs))
        }
        SmtTerm::ForAll(bindings, body) => {
            let vars: Vec<String> = bindings
                .iter()
                .map(|(n, s)| format!("({} {s})", quote_symbol(n)))
                .collect();
            format!("(forall ({}) {})", vars.join(" "), to_smtlib(body))
        }
        SmtTerm::Exists(bindings, body) => {
            let vars: Vec<String> = bindings
                .iter()
                .map(|(n, s)| format!("({} {s})", quote_symbol(n)))
                .collect();
            format!("(exists ({}) {})", vars.join(" "), to_smtlib(body))
        }
        SmtTerm::Ite(cond, then, els) => {
            format!(
                "(ite {} {} {})",
                to_smtlib(cond),
                to_smtlib(then),
                to_smtlib(els)
            )
        }
        SmtTerm::Select(array, index) => {
            format!("(select {} {})", to_smtlib(array), to_smtlib(index))
        }
        SmtTerm::Store(array, index, value) => format!(
            "(store {} {} {})",
            to_smtlib(array),
            to_smtlib(index),
            to_smtlib(value)
        ),
        SmtTerm::ConstArray(value) => {
            format!("((as const (Array Int Int)) {})", to_smtlib(value))
        }
        SmtTerm::App(name, args) => {
            if args.is_empty() {
                quote_symbol(name)
            } else {
                let inner: Vec<String> = args.iter().map(to_smtlib).collect();
                format!("({} {})", quote_symbol(name), inner.join(" "))
            }
        }
    }
}

/// Print a sort as SMT-LIB2 format.
pub fn sort_to_smtlib(sort: &SmtSort) -> &'static str {
    match sort {
        SmtSort::Bool => "Bool",
        SmtSort::Int => "Int",
        SmtSort::IntArray => "(Array Int Int)",
    }
}

/// Quote a symbol with `|...|` unless it is a simple SMT-LIB symbol.
pub fn quote_symbol(name: &str) -> String {
    const EXTRA: &str = "~!@$%^&*_-+=<>.?/";
    let simple = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || EXTRA.contains(c));
    if simple {
        name.to_string()
    } else {
        format!("|{}|", name.replace('|', "_"))
    }
}

/// Strip `|...|` quoting from a symbol printed by a solver.
pub fn unquote_symbol(name: &str) -> &str {
    name.strip_prefix('|')
        .and_then(|n| n.strip_suffix('|'))
        .unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_simple_term() {
        let term = SmtTerm::var("x").add(SmtTerm::int(1)).ge(SmtTerm::int(0));
        assert_eq!(to_smtlib(&term), "(>= (+ x 1) 0)");
    }

    #[test]
    fn print_and_term() {
        let term = SmtTerm::and(vec![
            SmtTerm::var("a").gt(SmtTerm::int(0)),
            SmtTerm::var("b").lt(SmtTerm::int(10)),
        ]);
        assert_eq!(to_smtlib(&term), "(and (> a 0) (< b 10))");
    }

    #[test]
    fn print_arrays_functions_and_negative_literals() {
        let mem = SmtTerm::const_array(SmtTerm::int(0)).store(SmtTerm::int(32), SmtTerm::int(-5));
        assert_eq!(
            to_smtlib(&mem.select(SmtTerm::var("mem@1!v2"))),
            "(select (store ((as const (Array Int Int)) 0) 32 (- 5)) mem@1!v2)"
        );
        let app = SmtTerm::app("event!log", vec![SmtTerm::int(1), SmtTerm::var("x")]);
        assert_eq!(to_smtlib(&app), "(event!log 1 x)");
    }

    #[test]
    fn symbols_with_spaces_are_quoted() {
        assert_eq!(quote_symbol("plain!name@1"), "plain!name@1");
        assert_eq!(quote_symbol("has space"), "|has space|");
        assert_eq!(quote_symbol("1abc"), "|1abc|");
        assert_eq!(unquote_symbol("|has space|"), "has space");
        assert_eq!(unquote_symbol("x"), "x");
    }
}
