/// SMT sorts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SmtSort {
    Bool,
    Int,
    /// `(Array Int Int)`, used for memory, storage and trace maps.
    IntArray,
}

impl std::fmt::Display for SmtSort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmtSort::Bool => write!(f, "Bool"),
            SmtSort::Int => write!(f, "Int"),
            SmtSort::IntArray => write!(f, "(Array Int Int)"),
        }
    }
}

impl From<equiv_ir::Sort> for SmtSort {
    fn from(sort: equiv_ir::Sort) -> Self {
        match sort {
            equiv_ir::Sort::Int => SmtSort::Int,
            equiv_ir::Sort::Bool => SmtSort::Bool,
            equiv_ir::Sort::Map => SmtSort::IntArray,
        }
    }
}
