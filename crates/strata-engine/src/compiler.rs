//! Turns procedure definitions into executable instructions.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use strata_sql::{
    analyze,
    ident::normalize_identifier,
    parse::parse_expressions,
    tree::{Expr, ResultColumn, Statement},
    AnalyzedStatement, RuleFlags, Table,
};
use tracing::{debug, warn};

use crate::{
    error::EngineError,
    extension::Namespace,
    schema::{Modifier, Procedure, Schema},
    value::Value,
};

const DML_KEYWORDS: &[&str] = &["select", "insert", "update", "delete", "with"];

/// Flags for statements that run on the write path.
const WRITE_RULES: RuleFlags = RuleFlags::ALL_RULES.union(RuleFlags::REPLACE_NAMED_PARAMETERS);
/// Flags for read-only and uncommitted paths.
const READ_RULES: RuleFlags =
    RuleFlags::NO_CARTESIAN_PRODUCT.union(RuleFlags::REPLACE_NAMED_PARAMETERS);

#[derive(Debug, Clone)]
pub struct CompiledProcedure {
    pub name: String,
    pub public: bool,
    pub mutative: bool,
    pub parameters: Vec<String>,
    pub(crate) instructions: Vec<Instruction>,
}

#[derive(Debug, Clone)]
pub(crate) enum Instruction {
    CheckModifier(Modifier),
    Dml { write: AnalyzedStatement, read: AnalyzedStatement },
    Call(CallInstruction),
}

#[derive(Debug, Clone)]
pub(crate) struct CallInstruction {
    pub target: CallTarget,
    pub args: Vec<Evaluator>,
    pub receivers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CallTarget {
    Local(String),
    Namespace { alias: String, method: String },
}

impl std::fmt::Display for CallTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallTarget::Local(name) => f.write_str(name),
            CallTarget::Namespace { alias, method } => write!(f, "{alias}.{method}"),
        }
    }
}

/// Produces one argument value at call time.
#[derive(Debug, Clone)]
pub(crate) enum Evaluator {
    Value(Value),
    Variable(String),
    /// `SELECT <expr>` evaluated by storage.
    Query(AnalyzedStatement),
}

enum Shape<'s> {
    Dml(&'s str),
    Call {
        receivers: Vec<String>,
        target: CallTarget,
        args: &'s str,
    },
}

fn invalid(procedure: &str, reason: impl Into<String>) -> EngineError {
    EngineError::InvalidStatement {
        procedure: procedure.to_owned(),
        reason: reason.into(),
    }
}

fn variable_name(raw: &str, procedure: &str) -> Result<String, EngineError> {
    let name = raw
        .trim()
        .strip_prefix('$')
        .ok_or_else(|| invalid(procedure, format!("receiver \"{}\" must start with $", raw.trim())))?;
    let name = normalize_identifier(name)
        .map_err(|reason| invalid(procedure, format!("receiver \"{raw}\": {reason}")))?;
    Ok(format!("${name}"))
}

fn method_name(raw: &str, procedure: &str) -> Result<String, EngineError> {
    let name = raw.trim().to_ascii_lowercase();
    let valid = name.starts_with(|c: char| c.is_ascii_lowercase())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(invalid(procedure, format!("invalid method name \"{raw}\"")))
    }
}

/// Splits a raw statement into DML or a call.
fn classify<'s>(raw: &'s str, procedure: &str) -> Result<Shape<'s>, EngineError> {
    let text = raw.trim().trim_end_matches(';').trim_end();
    let first = text
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default();
    if DML_KEYWORDS.iter().any(|k| first.eq_ignore_ascii_case(k)) {
        return Ok(Shape::Dml(text));
    }

    let (receivers, call) = if text.starts_with('$') {
        let (lhs, rhs) = text
            .split_once('=')
            .ok_or_else(|| invalid(procedure, format!("cannot parse \"{text}\"")))?;
        let receivers = lhs
            .split(',')
            .map(|name| variable_name(name, procedure))
            .collect::<Result<Vec<_>, _>>()?;
        (receivers, rhs.trim())
    } else {
        (Vec::new(), text)
    };

    let (Some(open), true) = (call.find('('), call.ends_with(')')) else {
        return Err(invalid(procedure, format!("unknown statement \"{text}\"")));
    };
    let target = match call[..open].split_once('.') {
        Some((alias, method)) => CallTarget::Namespace {
            alias: normalize_identifier(alias)
                .map_err(|reason| invalid(procedure, format!("alias \"{alias}\": {reason}")))?,
            method: method_name(method, procedure)?,
        },
        None => CallTarget::Local(method_name(&call[..open], procedure)?),
    };
    Ok(Shape::Call {
        receivers,
        target,
        args: &call[open + 1..call.len() - 1],
    })
}

/// Arguments are limited to literals, variables, operators and function
/// calls over those.
fn check_argument(expr: &Expr) -> bool {
    match expr {
        Expr::Literal(_) | Expr::BindParameter(_) => true,
        Expr::Unary { expr, .. } | Expr::Nested(expr) => check_argument(expr),
        Expr::Binary { left, right, .. } => check_argument(left) && check_argument(right),
        Expr::Function { args, .. } => match args {
            strata_sql::tree::FunctionArgs::Star => false,
            strata_sql::tree::FunctionArgs::List(args) => args.iter().all(check_argument),
        },
        _ => false,
    }
}

fn evaluator(expr: Expr, tables: &[Table], procedure: &str) -> Result<Evaluator, EngineError> {
    if !check_argument(&expr) {
        return Err(invalid(procedure, format!("argument \"{expr}\" is not allowed")));
    }
    let analyzed = analyze(
        &format!("SELECT {expr}"),
        tables,
        RuleFlags::REPLACE_NAMED_PARAMETERS,
    )?;

    if let Statement::Select(select) = &analyzed.statement {
        if let [ResultColumn::Expr { expr, .. }] = select.cores[0].columns.as_slice() {
            match expr {
                Expr::Literal(literal) => return Ok(Evaluator::Value(Value::from_literal(literal)?)),
                Expr::Placeholder(_) if analyzed.parameters.len() == 1 => {
                    return Ok(Evaluator::Variable(analyzed.parameters[0].clone()))
                }
                _ => {}
            }
        }
    }
    Ok(Evaluator::Query(analyzed))
}

/// Compiles one procedure. Returns it with the local procedures it calls.
fn compile_procedure(
    procedure: &Procedure,
    schema: &Schema,
    namespaces: &HashMap<String, Arc<dyn Namespace>>,
) -> Result<(CompiledProcedure, Vec<String>), EngineError> {
    let name = procedure.name.as_str();
    let view = procedure.is_view();
    let mut instructions = Vec::new();
    let mut callees = Vec::new();

    for modifier in &procedure.modifiers {
        match modifier {
            Modifier::Owner | Modifier::Authenticated => {
                instructions.push(Instruction::CheckModifier(modifier.clone()))
            }
            Modifier::View => {}
            Modifier::Unknown(raw) => {
                warn!(procedure = name, modifier = %raw, "ignoring unknown procedure modifier")
            }
        }
    }

    for raw in &procedure.statements {
        match classify(raw, name)? {
            Shape::Dml(sql) => {
                let write = analyze(sql, &schema.tables, WRITE_RULES)?;
                if view && write.mutative {
                    return Err(EngineError::ReadOnlyProcedureContainsDml {
                        procedure: name.to_owned(),
                        statement: sql.to_owned(),
                    });
                }
                let read = analyze(sql, &schema.tables, READ_RULES)?;
                instructions.push(Instruction::Dml { write, read });
            }
            Shape::Call {
                receivers,
                target,
                args,
            } => {
                match &target {
                    CallTarget::Local(callee) => {
                        if schema.procedure(callee).is_none() {
                            return Err(EngineError::ProcedureNotFound(callee.clone()));
                        }
                        callees.push(callee.clone());
                    }
                    CallTarget::Namespace { alias, method } => {
                        let namespace = namespaces
                            .get(alias)
                            .ok_or_else(|| EngineError::NamespaceNotFound(alias.clone()))?;
                        if view && namespace.mutates(method) {
                            return Err(EngineError::ReadOnlyProcedureCallsMutative {
                                procedure: name.to_owned(),
                                callee: target.to_string(),
                            });
                        }
                    }
                }
                let args = parse_expressions(args)?
                    .into_iter()
                    .map(|expr| evaluator(expr, &schema.tables, name))
                    .collect::<Result<Vec<_>, _>>()?;
                instructions.push(Instruction::Call(CallInstruction {
                    target,
                    args,
                    receivers,
                }));
            }
        }
    }

    Ok((
        CompiledProcedure {
            name: name.to_owned(),
            public: procedure.public,
            mutative: !view,
            parameters: procedure.parameters.clone(),
            instructions,
        },
        callees,
    ))
}

/// Compiles every procedure of a cleaned schema against the namespaces
/// initialized for it, keyed by alias.
pub fn compile_schema(
    schema: &Schema,
    namespaces: &HashMap<String, Arc<dyn Namespace>>,
) -> Result<HashMap<String, CompiledProcedure>, EngineError> {
    let mut compiled = HashMap::new();
    let mut calls = HashMap::new();
    for procedure in &schema.procedures {
        let (procedure, callees) = compile_procedure(procedure, schema, namespaces)?;
        calls.insert(procedure.name.clone(), callees);
        compiled.insert(procedure.name.clone(), procedure);
    }

    for procedure in schema.procedures.iter().filter(|p| p.is_view()) {
        check_view_calls(&procedure.name, schema, &calls)?;
    }
    debug!(schema = %schema.name, procedures = compiled.len(), "schema compiled");
    Ok(compiled)
}

/// Everything a view reaches through local calls must itself be a view.
fn check_view_calls(
    root: &str,
    schema: &Schema,
    calls: &HashMap<String, Vec<String>>,
) -> Result<(), EngineError> {
    let mut stack = vec![root.to_owned()];
    let mut visited = HashSet::new();
    while let Some(current) = stack.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }
        for callee in calls.get(&current).into_iter().flatten() {
            let is_view = schema.procedure(callee).is_some_and(Procedure::is_view);
            if !is_view {
                return Err(EngineError::ReadOnlyProcedureCallsMutative {
                    procedure: root.to_owned(),
                    callee: callee.clone(),
                });
            }
            stack.push(callee.clone());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{runtime::ScopeContext, storage::Session};

    /// Stand-in for a key-value namespace; only its write surface matters.
    struct Store;

    #[async_trait]
    impl Namespace for Store {
        async fn call(
            &self,
            _scope: &mut ScopeContext,
            _session: &mut dyn Session,
            _method: &str,
            _args: Vec<Value>,
        ) -> Result<Vec<Value>, EngineError> {
            Ok(Vec::new())
        }

        fn mutates(&self, method: &str) -> bool {
            method == "set"
        }
    }

    fn schema(procedures: serde_json::Value) -> Schema {
        let mut schema: Schema = serde_json::from_value(json!({
            "name": "app",
            "tables": [{
                "name": "users",
                "columns": [
                    {"name": "id", "type": "int", "attributes": [{"kind": "PRIMARY_KEY"}]},
                    {"name": "name", "type": "text"}
                ]
            }],
            "procedures": procedures
        }))
        .unwrap();
        schema.clean().unwrap();
        schema
    }

    fn compile(procedures: serde_json::Value) -> Result<HashMap<String, CompiledProcedure>, EngineError> {
        let namespaces: HashMap<String, Arc<dyn Namespace>> =
            HashMap::from([("kv".to_string(), Arc::new(Store) as Arc<dyn Namespace>)]);
        compile_schema(&schema(procedures), &namespaces)
    }

    #[test]
    fn dml_is_analyzed_for_both_paths() {
        let compiled = compile(json!([{
            "name": "names",
            "public": true,
            "modifiers": ["view"],
            "statements": ["SELECT name FROM users WHERE id > $min;"]
        }]))
        .unwrap();
        let names = &compiled["names"];
        assert!(!names.mutative);
        let Instruction::Dml { write, read } = &names.instructions[0] else {
            panic!("expected DML");
        };
        assert_eq!(write.sql, "SELECT name FROM users WHERE id > ?1 ORDER BY users.id");
        assert_eq!(read.sql, "SELECT name FROM users WHERE id > ?1");
        assert_eq!(write.parameters, vec!["$min"]);
    }

    #[test]
    fn view_with_insert_fails() {
        let err = compile(json!([{
            "name": "sneaky",
            "modifiers": ["VIEW"],
            "statements": ["INSERT INTO users (id, name) VALUES (1, 'a')"]
        }]))
        .unwrap_err();
        assert!(err.to_string().contains("read-only procedure contains DML"), "{err}");
    }

    #[test]
    fn view_reaching_mutation_transitively_fails() {
        let err = compile(json!([
            {"name": "top", "modifiers": ["view"], "statements": ["middle();"]},
            {"name": "middle", "modifiers": ["view"], "statements": ["bottom();"]},
            {"name": "bottom", "statements": ["DELETE FROM users WHERE id = 1"]}
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::ReadOnlyProcedureCallsMutative { ref callee, .. } if callee == "bottom"
        ));
    }

    #[test]
    fn views_cannot_call_writing_namespace_methods() {
        let err = compile(json!([
            {"name": "peek", "modifiers": ["view"], "statements": ["$v = kv.get(1);"]},
            {"name": "poke", "modifiers": ["view"], "statements": ["kv.set(1, 'x');"]}
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::ReadOnlyProcedureCallsMutative { ref procedure, ref callee }
                if procedure == "poke" && callee == "kv.set"
        ));
        compile(json!([{"name": "poke", "statements": ["kv.set(1, 'x');"]}])).unwrap();
    }

    #[test]
    fn recursive_views_compile() {
        compile(json!([
            {"name": "ping", "modifiers": ["view"], "statements": ["pong();"]},
            {"name": "pong", "modifiers": ["view"], "statements": ["ping();"]}
        ]))
        .unwrap();
    }

    #[test]
    fn calls_resolve_receivers_and_arguments() {
        let compiled = compile(json!([{
            "name": "store",
            "parameters": ["$k"],
            "modifiers": ["owner", "later"],
            "statements": ["$old, $other = kv.get($k, 'x', abs(-2), @caller);"]
        }]))
        .unwrap();
        let store = &compiled["store"];
        assert!(store.mutative);
        assert_eq!(store.instructions.len(), 2);
        assert!(matches!(
            store.instructions[0],
            Instruction::CheckModifier(Modifier::Owner)
        ));
        let Instruction::Call(call) = &store.instructions[1] else {
            panic!("expected call");
        };
        assert_eq!(
            call.target,
            CallTarget::Namespace {
                alias: "kv".into(),
                method: "get".into()
            }
        );
        assert_eq!(call.receivers, vec!["$old", "$other"]);
        assert!(matches!(&call.args[0], Evaluator::Variable(name) if name == "$k"));
        assert!(matches!(&call.args[1], Evaluator::Value(Value::Text(text)) if text == "x"));
        assert!(matches!(&call.args[2], Evaluator::Query(q) if q.sql == "SELECT abs(-2)"));
        assert!(matches!(&call.args[3], Evaluator::Variable(name) if name == "@caller"));
    }

    #[test]
    fn unknown_targets_and_shapes_are_rejected() {
        assert!(matches!(
            compile(json!([{"name": "a", "statements": ["missing();"]}])),
            Err(EngineError::ProcedureNotFound(_))
        ));
        assert!(matches!(
            compile(json!([{"name": "a", "statements": ["nope.get(1);"]}])),
            Err(EngineError::NamespaceNotFound(_))
        ));
        assert!(matches!(
            compile(json!([{"name": "a", "statements": ["PRAGMA foo"]}])),
            Err(EngineError::InvalidStatement { .. })
        ));
        assert!(matches!(
            compile(json!([{"name": "a", "statements": ["kv.get((SELECT 1));"]}])),
            Err(EngineError::InvalidStatement { .. })
        ));
    }

    #[test]
    fn cartesian_dml_fails_compilation() {
        assert!(matches!(
            compile(json!([{"name": "a", "statements": ["SELECT * FROM users AS a, users AS b"]}])),
            Err(EngineError::Analyze(_))
        ));
    }
}
