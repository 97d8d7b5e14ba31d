//! Rewrites named bind parameters into numbered positional placeholders.

use crate::tree::{walk::*, *};

#[derive(Default)]
pub struct ParameterRewriter {
    names: Vec<String>,
}

impl ParameterRewriter {
    /// Parameter names in placeholder order: `?1` binds `names[0]`.
    pub fn into_names(self) -> Vec<String> {
        self.names
    }
}

impl VisitorMut for ParameterRewriter {
    fn enter_expr(&mut self, node: &mut Expr) -> VisitResult {
        if let Expr::BindParameter(name) = node {
            let index = match self.names.iter().position(|known| known == name) {
                Some(index) => index,
                None => {
                    self.names.push(name.clone());
                    self.names.len() - 1
                }
            };
            *node = Expr::Placeholder(index + 1);
        }
        Ok(())
    }
}
