//! Query intent accumulated by the builder and handed to a backend.

use serde_json::{Map, Value};
use std::collections::HashMap;

/// One result row: column name to value.
pub type Row = Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Conj {
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
    ILike,
}

impl CompareOp {
    pub fn parse(op: &str) -> Option<CompareOp> {
        Some(match op.trim().to_lowercase().as_str() {
            "=" | "==" => CompareOp::Eq,
            "!=" | "<>" => CompareOp::Ne,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Lte,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Gte,
            "like" => CompareOp::Like,
            "ilike" => CompareOp::ILike,
            _ => return None,
        })
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Like => "LIKE",
            CompareOp::ILike => "ILIKE",
        }
    }
}

/// Right-hand side of a comparison after normalization.
#[derive(Clone, Debug)]
pub enum Operand {
    Value(Value),
    Sub(Box<Query>),
}

#[derive(Clone, Debug)]
pub enum InSource {
    List(Vec<Value>),
    Sub(Box<Query>),
}

#[derive(Clone, Debug)]
pub enum Condition {
    Compare { column: String, op: CompareOp, value: Operand },
    In { column: String, source: InSource, negated: bool },
    Null { column: String, negated: bool },
    Between { column: String, low: Value, high: Value, negated: bool },
    Exists { query: Box<Query>, negated: bool },
    Raw { sql: String, bindings: Vec<Value> },
    Group(Vec<WhereClause>),
}

#[derive(Clone, Debug)]
pub struct WhereClause {
    pub conj: Conj,
    pub condition: Condition,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Cross,
}

#[derive(Clone, Debug)]
pub struct Join {
    pub kind: JoinKind,
    pub table: String,
    /// `(left column, operator, right column)`; `None` for cross joins.
    pub on: Option<(String, String, String)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateFn {
    Count,
    Min,
    Max,
    Sum,
    Avg,
}

impl AggregateFn {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFn::Count => "count",
            AggregateFn::Min => "min",
            AggregateFn::Max => "max",
            AggregateFn::Sum => "sum",
            AggregateFn::Avg => "avg",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Aggregate {
    pub func: AggregateFn,
    /// Column or `*`.
    pub column: String,
    /// Output key; defaults to the function name.
    pub alias: String,
}

#[derive(Clone, Debug)]
pub struct Query {
    pub op: Operation,
    pub table: String,
    pub schema: Option<String>,
    /// Projection; empty means `*`.
    pub columns: Vec<String>,
    pub distinct: bool,
    pub wheres: Vec<WhereClause>,
    pub joins: Vec<Join>,
    pub order: Vec<(String, Direction)>,
    pub group_by: Vec<String>,
    pub having: Vec<WhereClause>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub aggregates: Vec<Aggregate>,
    /// Rows for INSERT.
    pub values: Vec<Row>,
    /// Assignments for UPDATE.
    pub set: Row,
    pub returning: Vec<String>,
    /// Column to PostgreSQL type, for parameter casts.
    pub casts: HashMap<String, &'static str>,
}

impl Query {
    pub fn new(table: impl Into<String>) -> Self {
        Query {
            op: Operation::Select,
            table: table.into(),
            schema: None,
            columns: Vec::new(),
            distinct: false,
            wheres: Vec::new(),
            joins: Vec::new(),
            order: Vec::new(),
            group_by: Vec::new(),
            having: Vec::new(),
            limit: None,
            offset: None,
            aggregates: Vec::new(),
            values: Vec::new(),
            set: Row::new(),
            returning: Vec::new(),
            casts: HashMap::new(),
        }
    }

    pub fn selects_all(&self) -> bool {
        self.columns.is_empty() || self.columns.iter().all(|c| c == "*")
    }
}
