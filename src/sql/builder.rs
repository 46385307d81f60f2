//! Fluent query builder. Accumulates intent into a `Query`, executes once, optionally hydrates rows into records.

use crate::error::AppError;
use crate::orm::{Model, Record, SchemaCore};
use crate::sql::query::*;
use crate::sql::render::{split_alias, to_sql, QueryBuf};
use crate::store::{QueryOutput, TxId};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::sync::Arc;

/// A builder argument before normalization.
pub enum Arg {
    Value(Value),
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
    Query(Box<QueryBuilder>),
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self {
        Arg::Value(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Value(Value::String(v.to_string()))
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Value(Value::String(v))
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl From<u64> for Arg {
    fn from(v: u64) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Value(Value::Bool(v))
    }
}

impl From<DateTime<Utc>> for Arg {
    fn from(v: DateTime<Utc>) -> Self {
        Arg::DateTime(v)
    }
}

impl From<NaiveDate> for Arg {
    fn from(v: NaiveDate) -> Self {
        Arg::Date(v)
    }
}

impl From<QueryBuilder> for Arg {
    fn from(v: QueryBuilder) -> Self {
        Arg::Query(Box::new(v))
    }
}

/// Normalize a filter argument: nested builders become sub-selects, dates become
/// ISO-8601 strings, booleans become the strings `"true"` / `"false"`.
///
/// Insert and update payloads are not normalized, so booleans stay native there
/// while filter comparisons see strings.
pub fn normalize_value(arg: Arg) -> Operand {
    match arg {
        Arg::Query(qb) => Operand::Sub(Box::new(qb.into_query())),
        Arg::DateTime(d) => Operand::Value(Value::String(d.to_rfc3339())),
        Arg::Date(d) => Operand::Value(Value::String(d.format("%Y-%m-%d").to_string())),
        Arg::Value(Value::Bool(b)) => Operand::Value(Value::String(b.to_string())),
        Arg::Value(v) => Operand::Value(v),
    }
}

/// Like `normalize_value`, but for positions that only take plain values.
fn normalize_plain(arg: Arg) -> Result<Value, String> {
    match normalize_value(arg) {
        Operand::Value(v) => Ok(v),
        Operand::Sub(_) => Err("a nested query is not allowed here".into()),
    }
}

/// Outcome of `QueryBuilder::execute`.
#[derive(Clone, Debug)]
pub enum QueryResult {
    Records(Vec<Record>),
    Record(Record),
    Rows(Vec<Row>),
    Row(Row),
    /// `first()` matched nothing.
    Empty,
    Affected(u64),
}

impl QueryResult {
    pub fn into_records(self) -> Vec<Record> {
        match self {
            QueryResult::Records(v) => v,
            QueryResult::Record(r) => vec![r],
            _ => Vec::new(),
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            QueryResult::Record(r) => Some(r),
            QueryResult::Records(v) => v.into_iter().next(),
            _ => None,
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryResult::Rows(v) => v,
            QueryResult::Row(r) => vec![r],
            QueryResult::Records(v) => v.iter().map(Record::data).collect(),
            QueryResult::Record(r) => vec![r.data()],
            QueryResult::Empty | QueryResult::Affected(_) => Vec::new(),
        }
    }

    pub fn into_row(self) -> Option<Row> {
        self.into_rows().into_iter().next()
    }

    /// First column of the first row, for aggregates.
    pub fn scalar(self) -> Option<Value> {
        self.into_row().and_then(|r| r.into_iter().next().map(|(_, v)| v))
    }

    pub fn affected(&self) -> u64 {
        match self {
            QueryResult::Affected(n) => *n,
            QueryResult::Rows(v) => v.len() as u64,
            QueryResult::Records(v) => v.len() as u64,
            QueryResult::Row(_) | QueryResult::Record(_) => 1,
            QueryResult::Empty => 0,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            QueryResult::Records(v) => Value::Array(v.iter().map(Record::to_json).collect()),
            QueryResult::Record(r) => r.to_json(),
            QueryResult::Rows(v) => Value::Array(v.iter().cloned().map(Value::Object).collect()),
            QueryResult::Row(r) => Value::Object(r.clone()),
            QueryResult::Empty => Value::Null,
            QueryResult::Affected(n) => Value::from(*n),
        }
    }
}

/// Single-use builder. Every chained call consumes and returns the same builder;
/// `execute` consumes it for good.
pub struct QueryBuilder {
    query: Query,
    core: Arc<SchemaCore>,
    model: Option<Model>,
    hydrate: bool,
    single: bool,
    tx: Option<TxId>,
    /// First misuse recorded while building; reported by `execute`.
    invalid: Option<String>,
}

impl QueryBuilder {
    pub(crate) fn new(core: Arc<SchemaCore>, table: impl Into<String>) -> Self {
        let mut query = Query::new(table);
        query.schema = Some(core.name.clone());
        QueryBuilder {
            query,
            core,
            model: None,
            hydrate: false,
            single: false,
            tx: None,
            invalid: None,
        }
    }

    pub(crate) fn for_model(model: Model, core: Arc<SchemaCore>) -> Self {
        let mut qb = QueryBuilder::new(core, model.table());
        for f in model.fields() {
            qb.query.casts.insert(f.column.clone(), f.field_type.pg_type());
        }
        qb.model = Some(model);
        qb.hydrate = true;
        qb
    }

    /// Keep column names mapped but return plain rows.
    pub(crate) fn plain(mut self) -> Self {
        self.hydrate = false;
        self
    }

    /// Whether rows will be hydrated into records.
    pub fn hydrates(&self) -> bool {
        self.hydrate && self.model.is_some()
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn into_query(self) -> Query {
        self.query
    }

    pub fn to_sql(&self) -> QueryBuf {
        to_sql(&self.query)
    }

    fn col(&self, name: &str) -> String {
        match &self.model {
            Some(m) => {
                let (col, alias) = split_alias(name);
                let mapped = m.column_name(col);
                match alias {
                    Some(a) => format!("{} as {}", mapped, a),
                    None => mapped,
                }
            }
            None => name.to_string(),
        }
    }

    fn projection(&mut self, cols: &[&str]) {
        let cols: Vec<String> = cols.iter().map(|c| self.col(c)).collect();
        if cols.iter().any(|c| c != "*") {
            self.hydrate = false;
        }
        self.query.columns = cols;
    }

    fn reject(mut self, what: String) -> Self {
        self.invalid.get_or_insert(what);
        self
    }

    fn push(mut self, conj: Conj, condition: Condition) -> Self {
        self.query.wheres.push(WhereClause { conj, condition });
        self
    }

    pub fn select(mut self, cols: &[&str]) -> Self {
        self.query.op = Operation::Select;
        self.projection(cols);
        self
    }

    pub fn distinct(mut self, cols: &[&str]) -> Self {
        self.query.distinct = true;
        self.projection(cols);
        self
    }

    /// Limit to one row and return it alone.
    pub fn first(mut self, cols: &[&str]) -> Self {
        self.projection(cols);
        self.query.limit = Some(1);
        self.single = true;
        self
    }

    /// Retarget the query at another table. Results are no longer hydrated.
    pub fn into(mut self, table: impl Into<String>) -> Self {
        self.query.table = table.into();
        self.hydrate = false;
        self
    }

    pub fn where_eq(self, column: &str, value: impl Into<Arg>) -> Self {
        self.and_where_op(column, CompareOp::Eq, value)
    }

    pub fn where_op(self, column: &str, op: CompareOp, value: impl Into<Arg>) -> Self {
        self.and_where_op(column, op, value)
    }

    pub fn and_where(self, column: &str, value: impl Into<Arg>) -> Self {
        self.and_where_op(column, CompareOp::Eq, value)
    }

    pub fn and_where_op(self, column: &str, op: CompareOp, value: impl Into<Arg>) -> Self {
        let column = self.col(column);
        let value = normalize_value(value.into());
        self.push(Conj::And, Condition::Compare { column, op, value })
    }

    pub fn or_where(self, column: &str, value: impl Into<Arg>) -> Self {
        self.or_where_op(column, CompareOp::Eq, value)
    }

    pub fn or_where_op(self, column: &str, op: CompareOp, value: impl Into<Arg>) -> Self {
        let column = self.col(column);
        let value = normalize_value(value.into());
        self.push(Conj::Or, Condition::Compare { column, op, value })
    }

    /// Conditions built inside `f` are wrapped in parentheses.
    pub fn where_group(self, f: impl FnOnce(QueryBuilder) -> QueryBuilder) -> Self {
        self.group(Conj::And, f)
    }

    pub fn or_where_group(self, f: impl FnOnce(QueryBuilder) -> QueryBuilder) -> Self {
        self.group(Conj::Or, f)
    }

    fn group(self, conj: Conj, f: impl FnOnce(QueryBuilder) -> QueryBuilder) -> Self {
        let mut inner = QueryBuilder::new(self.core.clone(), self.query.table.clone());
        inner.model = self.model.clone();
        let inner = f(inner);
        let mut this = match inner.invalid {
            Some(what) => self.reject(what),
            None => self,
        };
        if inner.query.wheres.is_empty() {
            return this;
        }
        this.query.wheres.push(WhereClause {
            conj,
            condition: Condition::Group(inner.query.wheres),
        });
        this
    }

    fn in_list<I, A>(self, conj: Conj, column: &str, values: I, negated: bool) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        let column = self.col(column);
        let mut args: Vec<Arg> = values.into_iter().map(Into::into).collect();
        // a lone nested builder is a sub-select
        if args.len() == 1 && matches!(args[0], Arg::Query(_)) {
            if let Some(Arg::Query(sub)) = args.pop() {
                return self.push(
                    conj,
                    Condition::In {
                        column,
                        source: InSource::Sub(Box::new(sub.into_query())),
                        negated,
                    },
                );
            }
        }
        let values: Result<Vec<Value>, String> = args.into_iter().map(normalize_plain).collect();
        match values {
            Ok(values) => self.push(
                conj,
                Condition::In {
                    column,
                    source: InSource::List(values),
                    negated,
                },
            ),
            Err(e) => self.reject(format!("IN list on {}: {}", column, e)),
        }
    }

    pub fn where_in<I, A>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.in_list(Conj::And, column, values, false)
    }

    pub fn where_not_in<I, A>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.in_list(Conj::And, column, values, true)
    }

    pub fn or_where_in<I, A>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.in_list(Conj::Or, column, values, false)
    }

    pub fn or_where_not_in<I, A>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.in_list(Conj::Or, column, values, true)
    }

    /// `column IN (sub-select)`.
    pub fn where_in_query(self, column: &str, sub: QueryBuilder) -> Self {
        let column = self.col(column);
        self.push(
            Conj::And,
            Condition::In {
                column,
                source: InSource::Sub(Box::new(sub.into_query())),
                negated: false,
            },
        )
    }

    fn null(self, conj: Conj, column: &str, negated: bool) -> Self {
        let column = self.col(column);
        self.push(conj, Condition::Null { column, negated })
    }

    pub fn where_null(self, column: &str) -> Self {
        self.null(Conj::And, column, false)
    }

    pub fn where_not_null(self, column: &str) -> Self {
        self.null(Conj::And, column, true)
    }

    pub fn or_where_null(self, column: &str) -> Self {
        self.null(Conj::Or, column, false)
    }

    pub fn or_where_not_null(self, column: &str) -> Self {
        self.null(Conj::Or, column, true)
    }

    fn between(self, conj: Conj, column: &str, low: Arg, high: Arg, negated: bool) -> Self {
        let column = self.col(column);
        match (normalize_plain(low), normalize_plain(high)) {
            (Ok(low), Ok(high)) => self.push(conj, Condition::Between { column, low, high, negated }),
            (Err(e), _) | (_, Err(e)) => self.reject(format!("BETWEEN on {}: {}", column, e)),
        }
    }

    pub fn where_between(self, column: &str, low: impl Into<Arg>, high: impl Into<Arg>) -> Self {
        self.between(Conj::And, column, low.into(), high.into(), false)
    }

    pub fn where_not_between(self, column: &str, low: impl Into<Arg>, high: impl Into<Arg>) -> Self {
        self.between(Conj::And, column, low.into(), high.into(), true)
    }

    pub fn or_where_between(self, column: &str, low: impl Into<Arg>, high: impl Into<Arg>) -> Self {
        self.between(Conj::Or, column, low.into(), high.into(), false)
    }

    pub fn or_where_not_between(self, column: &str, low: impl Into<Arg>, high: impl Into<Arg>) -> Self {
        self.between(Conj::Or, column, low.into(), high.into(), true)
    }

    pub fn where_exists(self, sub: QueryBuilder) -> Self {
        self.push(
            Conj::And,
            Condition::Exists {
                query: Box::new(sub.into_query()),
                negated: false,
            },
        )
    }

    pub fn where_not_exists(self, sub: QueryBuilder) -> Self {
        self.push(
            Conj::And,
            Condition::Exists {
                query: Box::new(sub.into_query()),
                negated: true,
            },
        )
    }

    pub fn or_where_exists(self, sub: QueryBuilder) -> Self {
        self.push(
            Conj::Or,
            Condition::Exists {
                query: Box::new(sub.into_query()),
                negated: false,
            },
        )
    }

    /// Raw SQL fragment with `?` placeholders.
    pub fn where_raw(self, sql: &str, bindings: Vec<Value>) -> Self {
        self.push(
            Conj::And,
            Condition::Raw {
                sql: sql.to_string(),
                bindings,
            },
        )
    }

    pub fn or_where_raw(self, sql: &str, bindings: Vec<Value>) -> Self {
        self.push(
            Conj::Or,
            Condition::Raw {
                sql: sql.to_string(),
                bindings,
            },
        )
    }

    fn join(mut self, kind: JoinKind, table: &str, on: Option<(&str, &str, &str)>) -> Self {
        self.query.joins.push(Join {
            kind,
            table: table.to_string(),
            on: on.map(|(l, op, r)| (l.to_string(), op.to_string(), r.to_string())),
        });
        self
    }

    pub fn inner_join(self, table: &str, left: &str, op: &str, right: &str) -> Self {
        self.join(JoinKind::Inner, table, Some((left, op, right)))
    }

    pub fn left_join(self, table: &str, left: &str, op: &str, right: &str) -> Self {
        self.join(JoinKind::Left, table, Some((left, op, right)))
    }

    pub fn right_join(self, table: &str, left: &str, op: &str, right: &str) -> Self {
        self.join(JoinKind::Right, table, Some((left, op, right)))
    }

    pub fn cross_join(self, table: &str) -> Self {
        self.join(JoinKind::Cross, table, None)
    }

    pub fn order_by(mut self, column: &str, direction: Direction) -> Self {
        let column = self.col(column);
        self.query.order.push((column, direction));
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.query.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.query.offset = Some(n);
        self
    }

    pub fn group_by(mut self, cols: &[&str]) -> Self {
        let cols: Vec<String> = cols.iter().map(|c| self.col(c)).collect();
        self.query.group_by.extend(cols);
        self
    }

    pub fn having(mut self, column: &str, op: CompareOp, value: impl Into<Arg>) -> Self {
        let column = self.col(column);
        let value = normalize_value(value.into());
        self.query.having.push(WhereClause {
            conj: Conj::And,
            condition: Condition::Compare { column, op, value },
        });
        self
    }

    fn aggregate(mut self, func: AggregateFn, column: &str) -> Self {
        let (col, alias) = split_alias(column);
        let col = if col == "*" { col.to_string() } else { self.col(col) };
        self.query.aggregates.push(Aggregate {
            func,
            column: col,
            alias: alias.unwrap_or(func.name()).to_string(),
        });
        self.hydrate = false;
        self
    }

    pub fn count(self, column: &str) -> Self {
        self.aggregate(AggregateFn::Count, column)
    }

    pub fn min(self, column: &str) -> Self {
        self.aggregate(AggregateFn::Min, column)
    }

    pub fn max(self, column: &str) -> Self {
        self.aggregate(AggregateFn::Max, column)
    }

    pub fn sum(self, column: &str) -> Self {
        self.aggregate(AggregateFn::Sum, column)
    }

    pub fn avg(self, column: &str) -> Self {
        self.aggregate(AggregateFn::Avg, column)
    }

    pub fn insert(mut self, row: Row) -> Self {
        self.query.op = Operation::Insert;
        self.query.values.push(row);
        self
    }

    pub fn insert_many(mut self, rows: Vec<Row>) -> Self {
        self.query.op = Operation::Insert;
        self.query.values.extend(rows);
        self
    }

    pub fn update(mut self, set: Row) -> Self {
        self.query.op = Operation::Update;
        self.query.set = set;
        self
    }

    pub fn remove(mut self) -> Self {
        self.query.op = Operation::Delete;
        self
    }

    pub fn returning(mut self, cols: &[&str]) -> Self {
        let cols: Vec<String> = cols.iter().map(|c| self.col(c)).collect();
        self.query.returning = cols;
        self
    }

    /// Run inside an explicit transaction instead of the schema's current one.
    pub fn then_transaction(mut self, tx: TxId) -> Self {
        self.tx = Some(tx);
        self
    }

    /// Execute against the backend. Uses the schema's open transaction when no
    /// explicit one was given.
    pub async fn execute(self) -> Result<QueryResult, AppError> {
        if let Some(what) = self.invalid {
            return Err(AppError::Validation(what));
        }
        let tx = self.tx.or_else(|| self.core.current_transaction());
        if self.core.debug {
            let buf = to_sql(&self.query);
            tracing::debug!(schema = %self.core.name, sql = %buf.sql, params = ?buf.params, tx = ?tx, "query");
        }
        let output = match self.core.backend.execute(&self.query, tx).await {
            Ok(o) => o,
            Err(e) => {
                tracing::debug!(table = %self.query.table, error = %e, "query failed");
                return Err(e);
            }
        };
        let rows = match output {
            QueryOutput::Affected(n) => return Ok(QueryResult::Affected(n)),
            QueryOutput::Rows(rows) => rows,
        };
        let hydrate = self.hydrates();
        Ok(match (self.model, hydrate, self.single) {
            (Some(model), true, true) => match rows.into_iter().next() {
                Some(row) => QueryResult::Record(model.hydrate_record(row)),
                None => QueryResult::Empty,
            },
            (Some(model), true, false) => QueryResult::Records(model.hydrate_rows(rows)),
            (_, _, true) => match rows.into_iter().next() {
                Some(row) => QueryResult::Row(row),
                None => QueryResult::Empty,
            },
            _ => QueryResult::Rows(rows),
        })
    }
}
