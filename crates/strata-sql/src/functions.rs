//! Deterministic function table.
//!
//! Only functions whose result depends solely on their arguments are
//! callable. Time, randomness and locale dependent functions are absent.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Scalar,
    Aggregate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionDef {
    pub name: &'static str,
    pub kind: FunctionKind,
    pub min_args: usize,
    /// `None` means variadic.
    pub max_args: Option<usize>,
    pub accepts_star: bool,
}

const fn scalar(name: &'static str, min_args: usize, max_args: Option<usize>) -> FunctionDef {
    FunctionDef {
        name,
        kind: FunctionKind::Scalar,
        min_args,
        max_args,
        accepts_star: false,
    }
}

const fn aggregate(name: &'static str, accepts_star: bool) -> FunctionDef {
    FunctionDef {
        name,
        kind: FunctionKind::Aggregate,
        min_args: 1,
        max_args: Some(1),
        accepts_star,
    }
}

const FUNCTIONS: &[FunctionDef] = &[
    scalar("abs", 1, Some(1)),
    scalar("coalesce", 2, None),
    scalar("hex", 1, Some(1)),
    scalar("ifnull", 2, Some(2)),
    scalar("instr", 2, Some(2)),
    scalar("length", 1, Some(1)),
    scalar("lower", 1, Some(1)),
    scalar("ltrim", 1, Some(2)),
    scalar("nullif", 2, Some(2)),
    scalar("replace", 3, Some(3)),
    scalar("rtrim", 1, Some(2)),
    scalar("substr", 2, Some(3)),
    scalar("trim", 1, Some(2)),
    scalar("upper", 1, Some(1)),
    aggregate("count", true),
    aggregate("max", false),
    aggregate("min", false),
    aggregate("sum", false),
];

pub fn lookup(name: &str) -> Option<&'static FunctionDef> {
    FUNCTIONS.iter().find(|def| def.name == name)
}

pub fn is_aggregate(name: &str) -> bool {
    lookup(name).is_some_and(|def| def.kind == FunctionKind::Aggregate)
}

impl FunctionDef {
    /// Validates an argument count, returning the reason on failure.
    pub fn check_arity(&self, count: usize) -> Result<(), String> {
        if count < self.min_args {
            return Err(format!(
                "expected at least {} argument(s), got {count}",
                self.min_args
            ));
        }
        match self.max_args {
            Some(max) if count > max => Err(format!(
                "expected at most {max} argument(s), got {count}"
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_deterministic_functions_are_absent() {
        for name in ["random", "now", "datetime", "date", "changes", "avg"] {
            assert!(lookup(name).is_none(), "{name} should not be callable");
        }
    }

    #[test]
    fn checks_arity() {
        let substr = lookup("substr").unwrap();
        assert!(substr.check_arity(2).is_ok());
        assert!(substr.check_arity(1).is_err());
        assert!(substr.check_arity(4).is_err());
        assert!(lookup("coalesce").unwrap().check_arity(9).is_ok());
        assert!(is_aggregate("count"));
        assert!(!is_aggregate("lower"));
    }
}
