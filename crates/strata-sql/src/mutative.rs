//! Mutativity classification.

use crate::tree::{walk::*, *};

#[derive(Default)]
struct Mutativity {
    mutative: bool,
}

impl VisitorMut for Mutativity {
    fn enter_insert(&mut self, _node: &mut InsertStmt) -> VisitResult {
        self.mutative = true;
        Ok(())
    }

    fn enter_update(&mut self, _node: &mut UpdateStmt) -> VisitResult {
        self.mutative = true;
        Ok(())
    }

    fn enter_delete(&mut self, _node: &mut DeleteStmt) -> VisitResult {
        self.mutative = true;
        Ok(())
    }

    fn enter_ddl(&mut self, _node: &mut DdlStmt) -> VisitResult {
        self.mutative = true;
        Ok(())
    }
}

/// Whether executing `stmt` can change stored state.
pub fn is_mutative(stmt: &mut Statement) -> Result<bool, crate::AnalyzeError> {
    let mut visitor = Mutativity::default();
    walk_statement(&mut visitor, stmt)?;
    Ok(visitor.mutative)
}
