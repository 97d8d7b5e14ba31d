//! Closed SQL syntax tree accepted by the analyzer.
//!
//! Every statement the analyzer rewrites is converted from the generic
//! `sqlparser` AST into these types first. The variant sets are deliberately
//! small: anything that cannot be represented here is rejected during
//! conversion, so every pass can match exhaustively.

mod display;
pub mod walk;

/// Top-level statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Select(SelectStmt),
    Insert(InsertStmt),
    Update(UpdateStmt),
    Delete(DeleteStmt),
    Ddl(DdlStmt),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectStmt {
    pub ctes: Vec<Cte>,
    /// Compound members in source order; never empty.
    pub cores: Vec<SelectCore>,
    /// Operators between consecutive cores (`cores.len() - 1` entries).
    pub compound_ops: Vec<CompoundOperator>,
    pub order_by: Vec<OrderingTerm>,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
}

impl SelectStmt {
    pub fn is_compound(&self) -> bool {
        self.cores.len() > 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundOperator {
    Union,
    UnionAll,
    Intersect,
    Except,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cte {
    pub name: String,
    pub columns: Vec<String>,
    pub select: SelectStmt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectCore {
    pub distinct: bool,
    pub columns: Vec<ResultColumn>,
    /// Comma separated FROM items. More than one is a cartesian product.
    pub from: Vec<FromItem>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromItem {
    pub relation: Relation,
    pub joins: Vec<Join>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    Table {
        name: String,
        alias: Option<String>,
    },
    Subquery {
        select: Box<SelectStmt>,
        alias: Option<String>,
    },
}

impl Relation {
    /// Name other clauses use to refer to this relation.
    pub fn reference_name(&self) -> Option<&str> {
        match self {
            Relation::Table { name, alias } => Some(alias.as_deref().unwrap_or(name)),
            Relation::Subquery { alias, .. } => alias.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub operator: JoinOperator,
    pub relation: Relation,
    pub constraint: JoinConstraint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOperator {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinConstraint {
    On(Expr),
    Using(Vec<String>),
    Natural,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultColumn {
    Star,
    TableStar(String),
    Expr { expr: Expr, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderingTerm {
    pub expr: Expr,
    pub direction: Option<OrderDirection>,
    pub nulls: Option<NullsOrder>,
}

impl OrderingTerm {
    pub fn ascending(expr: Expr) -> Self {
        Self {
            expr,
            direction: None,
            nulls: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsOrder {
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStmt {
    pub table: String,
    pub columns: Vec<String>,
    pub source: InsertSource,
    pub upsert: Option<Upsert>,
    pub returning: Vec<ResultColumn>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertSource {
    Values(Vec<Vec<Expr>>),
    Select(Box<SelectStmt>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upsert {
    pub target: Vec<String>,
    pub action: UpsertAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertAction {
    DoNothing,
    DoUpdate {
        assignments: Vec<Assignment>,
        where_clause: Option<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub column: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStmt {
    pub table: String,
    pub alias: Option<String>,
    pub assignments: Vec<Assignment>,
    pub from: Option<FromItem>,
    pub where_clause: Option<Expr>,
    pub returning: Vec<ResultColumn>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteStmt {
    pub table: String,
    pub alias: Option<String>,
    pub where_clause: Option<Expr>,
    pub returning: Vec<ResultColumn>,
}

/// Schema changing statement. Kept opaque: it is classified, never rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlStmt {
    pub kind: DdlKind,
    pub sql: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlKind {
    CreateTable,
    CreateIndex,
    AlterTable,
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal(Literal),
    /// `$name` or `@name`.
    BindParameter(String),
    /// Positional `?N` placeholder, 1-based.
    Placeholder(usize),
    Column {
        table: Option<String>,
        column: String,
    },
    Unary {
        op: UnaryOperator,
        expr: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOperator,
        right: Box<Expr>,
    },
    Function {
        name: String,
        distinct: bool,
        args: FunctionArgs,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    InSelect {
        expr: Box<Expr>,
        select: Box<SelectStmt>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        escape: Option<Box<Expr>>,
        negated: bool,
    },
    Case {
        operand: Option<Box<Expr>>,
        branches: Vec<(Expr, Expr)>,
        else_result: Option<Box<Expr>>,
    },
    Exists {
        select: Box<SelectStmt>,
        negated: bool,
    },
    Subquery(Box<SelectStmt>),
    Collate {
        expr: Box<Expr>,
        collation: String,
    },
    Cast {
        expr: Box<Expr>,
        to: CastType,
    },
    Nested(Box<Expr>),
}

impl Expr {
    pub fn column(table: Option<&str>, column: &str) -> Self {
        Expr::Column {
            table: table.map(str::to_owned),
            column: column.to_owned(),
        }
    }

    pub fn integer(value: i64) -> Self {
        Expr::Literal(Literal::Number(value.to_string()))
    }
}

/// Literal values as written. The cleaner normalizes and validates them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Null,
    Number(String),
    Text(String),
    Bool(bool),
    /// Hex digits of an `X'..'` literal.
    Blob(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionArgs {
    Star,
    List(Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Minus,
    Plus,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Concat,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    BitAnd,
    BitOr,
}

impl BinaryOperator {
    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOperator::Add
                | BinaryOperator::Subtract
                | BinaryOperator::Multiply
                | BinaryOperator::Divide
                | BinaryOperator::Modulo
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastType {
    Int,
    Text,
    Blob,
    Bool,
}
