//! Call-scope interpreter for compiled procedures.

use std::collections::HashMap;

use futures::future::BoxFuture;
use tracing::trace;

use crate::{
    cancel::CancelToken,
    compiler::{CallInstruction, CallTarget, CompiledProcedure, Evaluator, Instruction},
    dataset::Dataset,
    error::EngineError,
    schema::Modifier,
    storage::Session,
    value::{RowSet, Value},
};

/// Per-invocation state. Every nested call runs in a child scope that keeps
/// the caller identity and never gains mutability. Entering a view drops
/// mutability for that scope and everything it calls.
#[derive(Debug)]
pub struct ScopeContext {
    signer: Vec<u8>,
    caller: String,
    dbid: String,
    procedure: String,
    mutative: bool,
    /// Set for the whole chain started by `execute`: DML uses the fully
    /// ordered statements even where the scope itself is read-only.
    ordered: bool,
    values: HashMap<String, Value>,
    result: Option<RowSet>,
    depth: usize,
    max_depth: usize,
    cancel: CancelToken,
}

impl ScopeContext {
    pub(crate) fn root(
        dbid: &str,
        procedure: &str,
        signer: Vec<u8>,
        caller: String,
        mutative: bool,
        max_depth: usize,
        cancel: CancelToken,
    ) -> Self {
        Self {
            signer,
            caller,
            dbid: dbid.to_owned(),
            procedure: procedure.to_owned(),
            mutative,
            ordered: mutative,
            values: HashMap::new(),
            result: None,
            depth: 0,
            max_depth,
            cancel,
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(dbid: &str, mutative: bool) -> Self {
        Self::root(dbid, "", Vec::new(), String::new(), mutative, 8, CancelToken::new())
    }

    pub fn signer(&self) -> &[u8] {
        &self.signer
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    /// Dataset whose procedure is currently running.
    pub fn dbid(&self) -> &str {
        &self.dbid
    }

    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    pub fn is_mutative(&self) -> bool {
        self.mutative
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn child(&self) -> Result<ScopeContext, EngineError> {
        if self.depth >= self.max_depth {
            return Err(EngineError::MaxCallDepth(self.max_depth));
        }
        Ok(Self {
            signer: self.signer.clone(),
            caller: self.caller.clone(),
            dbid: self.dbid.clone(),
            procedure: self.procedure.clone(),
            mutative: self.mutative,
            ordered: self.ordered,
            values: HashMap::new(),
            result: None,
            depth: self.depth + 1,
            max_depth: self.max_depth,
            cancel: self.cancel.clone(),
        })
    }

    pub(crate) fn enter(&mut self, dbid: &str, procedure: &str) {
        self.dbid = dbid.to_owned();
        self.procedure = procedure.to_owned();
    }

    /// Value of a `$variable` or an `@environment` name. Unset variables
    /// read as NULL.
    pub fn value(&self, name: &str) -> Value {
        match name {
            "@caller" => Value::Text(self.caller.clone()),
            "@signer" => Value::Blob(self.signer.clone()),
            "@dataset" => Value::Text(self.dbid.clone()),
            "@procedure" => Value::Text(self.procedure.clone()),
            _ => self.values.get(name).cloned().unwrap_or(Value::Null),
        }
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_owned(), value);
    }

    pub fn result(&self) -> Option<&RowSet> {
        self.result.as_ref()
    }

    pub(crate) fn take_result(&mut self) -> Option<RowSet> {
        self.result.take()
    }

    fn bind(&self, names: &[String]) -> Vec<Value> {
        names.iter().map(|name| self.value(name)).collect()
    }
}

/// Runs `procedure` of `dataset` in `scope`, leaving its last result in the
/// scope.
pub(crate) fn run_procedure<'a>(
    dataset: &'a Dataset,
    procedure: &'a CompiledProcedure,
    scope: &'a mut ScopeContext,
    session: &'a mut dyn Session,
    args: Vec<Value>,
) -> BoxFuture<'a, Result<(), EngineError>> {
    Box::pin(async move {
        if args.len() != procedure.parameters.len() {
            return Err(EngineError::IncorrectNumberOfArguments {
                procedure: procedure.name.clone(),
                expected: procedure.parameters.len(),
                got: args.len(),
            });
        }
        if procedure.mutative && !scope.mutative {
            return Err(EngineError::MutativeProcedure(procedure.name.clone()));
        }
        if !procedure.mutative {
            scope.mutative = false;
        }
        for (name, value) in procedure.parameters.iter().zip(args) {
            scope.set(name, value);
        }
        trace!(dbid = %scope.dbid, procedure = %procedure.name, depth = scope.depth, "running procedure");

        for instruction in &procedure.instructions {
            scope.cancel.check()?;
            match instruction {
                Instruction::CheckModifier(modifier) => {
                    check_modifier(dataset, procedure, scope, modifier)?
                }
                Instruction::Dml { write, read } => {
                    let statement = if scope.ordered { write } else { read };
                    let params = scope.bind(&statement.parameters);
                    let rows = if scope.mutative {
                        session.execute(dataset.dbid(), &statement.sql, &params).await?
                    } else {
                        session.query(dataset.dbid(), &statement.sql, &params).await?
                    };
                    scope.result = Some(rows);
                }
                Instruction::Call(call) => run_call(dataset, call, scope, &mut *session).await?,
            }
        }
        Ok(())
    })
}

fn check_modifier(
    dataset: &Dataset,
    procedure: &CompiledProcedure,
    scope: &ScopeContext,
    modifier: &Modifier,
) -> Result<(), EngineError> {
    match modifier {
        Modifier::Owner if scope.signer != dataset.schema().owner => Err(EngineError::NotOwner(
            format!("{}.{}", dataset.dbid(), procedure.name),
        )),
        Modifier::Authenticated if scope.signer.is_empty() => {
            Err(EngineError::NotAuthenticated(procedure.name.clone()))
        }
        _ => Ok(()),
    }
}

async fn evaluate(
    evaluator: &Evaluator,
    dataset: &Dataset,
    scope: &ScopeContext,
    session: &mut dyn Session,
) -> Result<Value, EngineError> {
    match evaluator {
        Evaluator::Value(value) => Ok(value.clone()),
        Evaluator::Variable(name) => Ok(scope.value(name)),
        Evaluator::Query(statement) => {
            let params = scope.bind(&statement.parameters);
            let rows = session
                .query(dataset.dbid(), &statement.sql, &params)
                .await?;
            Ok(rows
                .first_row()
                .and_then(|row| row.first())
                .cloned()
                .unwrap_or(Value::Null))
        }
    }
}

async fn run_call(
    dataset: &Dataset,
    call: &CallInstruction,
    scope: &mut ScopeContext,
    session: &mut dyn Session,
) -> Result<(), EngineError> {
    let mut args = Vec::with_capacity(call.args.len());
    for evaluator in &call.args {
        args.push(evaluate(evaluator, dataset, scope, &mut *session).await?);
    }

    let results = match &call.target {
        CallTarget::Local(name) => {
            let callee = dataset.procedure(name)?;
            let mut child = scope.child()?;
            child.enter(dataset.dbid(), name);
            run_procedure(dataset, callee, &mut child, &mut *session, args).await?;
            let returned = child.take_result();
            let values = returned
                .as_ref()
                .and_then(RowSet::first_row)
                .map(<[Value]>::to_vec)
                .unwrap_or_default();
            if returned.is_some() {
                scope.result = returned;
            }
            values
        }
        CallTarget::Namespace { alias, method } => {
            let namespace = dataset.namespace(alias)?;
            let mut child = scope.child()?;
            namespace
                .call(&mut child, &mut *session, method, args)
                .await?
        }
    };

    if call.receivers.len() > results.len() {
        return Err(EngineError::ReceiverMismatch {
            callee: call.target.to_string(),
            expected: call.receivers.len(),
            returned: results.len(),
        });
    }
    for (name, value) in call.receivers.iter().zip(results) {
        scope.set(name, value);
    }
    Ok(())
}
