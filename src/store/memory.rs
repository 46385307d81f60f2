//! In-process backend that evaluates query intent over plain rows. Used by tests and demos.
//!
//! Transactions snapshot every table on `begin` and restore the snapshot on
//! `rollback`; there is no isolation between concurrent transactions. Joins and
//! raw SQL are rejected.

use crate::error::AppError;
use crate::sql::*;
use crate::store::{Backend, QueryOutput, TableDef, TxId};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

#[derive(Default)]
struct Table {
    rows: Vec<Row>,
    /// Auto-increment column and last value handed out.
    serial: Option<(String, i64)>,
}

#[derive(Default)]
struct Db {
    tables: HashMap<String, Table>,
}

impl Db {
    fn snapshot(&self) -> Snapshot {
        self.tables
            .iter()
            .map(|(k, t)| (k.clone(), (t.rows.clone(), t.serial.clone())))
            .collect()
    }
}

type Snapshot = HashMap<String, (Vec<Row>, Option<(String, i64)>)>;

#[derive(Default)]
pub struct MemoryBackend {
    db: Mutex<Db>,
    txs: Mutex<HashMap<TxId, Snapshot>>,
    executed: AtomicUsize,
    latency: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Yield to the scheduler before every operation so concurrent callers interleave.
    pub fn with_latency(mut self) -> Self {
        self.latency = true;
        self
    }

    /// Number of queries executed so far.
    pub fn executed(&self) -> usize {
        self.executed.load(AtomicOrdering::SeqCst)
    }

    /// Current rows of a table, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.db
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    async fn tick(&self) {
        self.executed.fetch_add(1, AtomicOrdering::SeqCst);
        if self.latency {
            tokio::task::yield_now().await;
        }
    }

    fn check_tx(&self, tx: Option<TxId>) -> Result<(), AppError> {
        match tx {
            Some(id) if !self.txs.lock().contains_key(&id) => {
                Err(AppError::Backend(format!("no open transaction {}", id)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn execute(&self, query: &Query, tx: Option<TxId>) -> Result<QueryOutput, AppError> {
        self.tick().await;
        self.check_tx(tx)?;
        let mut db = self.db.lock();
        run(&mut db, query)
    }

    async fn raw(&self, _sql: &str, _bindings: &[Value], _tx: Option<TxId>) -> Result<QueryOutput, AppError> {
        self.tick().await;
        Err(AppError::Backend("raw SQL is not supported by the memory backend".into()))
    }

    async fn sync_table(&self, table: &TableDef) -> Result<(), AppError> {
        let mut db = self.db.lock();
        let t = db.tables.entry(table.name.clone()).or_default();
        if t.serial.is_none() {
            t.serial = table
                .columns
                .iter()
                .find(|c| c.auto_increment)
                .map(|c| (c.name.clone(), 0));
        }
        Ok(())
    }

    async fn begin(&self) -> Result<TxId, AppError> {
        if self.latency {
            tokio::task::yield_now().await;
        }
        let snap = self.db.lock().snapshot();
        let id = TxId::new_v4();
        self.txs.lock().insert(id, snap);
        Ok(id)
    }

    async fn commit(&self, tx: TxId) -> Result<(), AppError> {
        match self.txs.lock().remove(&tx) {
            Some(_) => Ok(()),
            None => Err(AppError::Backend(format!("no open transaction {}", tx))),
        }
    }

    async fn rollback(&self, tx: TxId) -> Result<(), AppError> {
        let snap = self
            .txs
            .lock()
            .remove(&tx)
            .ok_or_else(|| AppError::Backend(format!("no open transaction {}", tx)))?;
        let mut db = self.db.lock();
        db.tables = snap
            .into_iter()
            .map(|(k, (rows, serial))| (k, Table { rows, serial }))
            .collect();
        Ok(())
    }
}

fn run(db: &mut Db, q: &Query) -> Result<QueryOutput, AppError> {
    if !q.joins.is_empty() {
        return Err(AppError::Backend("joins are not supported by the memory backend".into()));
    }
    match q.op {
        Operation::Select => select(db, q).map(QueryOutput::Rows),
        Operation::Insert => insert(db, q),
        Operation::Update => update(db, q),
        Operation::Delete => delete(db, q),
    }
}

fn bare(column: &str) -> &str {
    column.rsplit('.').next().unwrap_or(column)
}

fn select(db: &Db, q: &Query) -> Result<Vec<Row>, AppError> {
    let source = db.tables.get(&q.table).map(|t| t.rows.as_slice()).unwrap_or(&[]);
    let mut rows = Vec::new();
    for row in source {
        if matches(db, row, &q.wheres)? {
            rows.push(row.clone());
        }
    }
    let mut rows = if q.aggregates.is_empty() && q.group_by.is_empty() {
        rows
    } else {
        aggregate(db, q, rows)?
    };
    if !q.order.is_empty() {
        rows.sort_by(|a, b| {
            for (col, dir) in &q.order {
                let ord = order_values(a.get(bare(col)), b.get(bare(col)));
                let ord = if *dir == Direction::Desc { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }
    let mut rows: Vec<Row> = if q.aggregates.is_empty() && q.group_by.is_empty() {
        rows.iter().map(|r| project(r, &q.columns)).collect()
    } else {
        rows
    };
    if q.distinct {
        let mut seen: Vec<Row> = Vec::new();
        rows.retain(|r| {
            if seen.contains(r) {
                false
            } else {
                seen.push(r.clone());
                true
            }
        });
    }
    let offset = q.offset.unwrap_or(0) as usize;
    let rows = rows.into_iter().skip(offset);
    Ok(match q.limit {
        Some(n) => rows.take(n as usize).collect(),
        None => rows.collect(),
    })
}

fn project(row: &Row, columns: &[String]) -> Row {
    if columns.is_empty() || columns.iter().all(|c| c == "*") {
        return row.clone();
    }
    let mut out = Row::new();
    for c in columns {
        if c == "*" {
            out.extend(row.clone());
            continue;
        }
        let (col, alias) = split_alias(c);
        let col = bare(col);
        out.insert(
            alias.unwrap_or(col).to_string(),
            row.get(col).cloned().unwrap_or(Value::Null),
        );
    }
    out
}

fn aggregate(db: &Db, q: &Query, rows: Vec<Row>) -> Result<Vec<Row>, AppError> {
    let mut groups: Vec<(Row, Vec<Row>)> = Vec::new();
    for row in rows {
        let key: Row = q
            .group_by
            .iter()
            .map(|c| (bare(c).to_string(), row.get(bare(c)).cloned().unwrap_or(Value::Null)))
            .collect();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(row),
            None => groups.push((key, vec![row])),
        }
    }
    if groups.is_empty() && q.group_by.is_empty() {
        groups.push((Row::new(), Vec::new()));
    }
    let mut out = Vec::with_capacity(groups.len());
    for (key, members) in groups {
        let mut row = Row::new();
        for c in &q.columns {
            let (col, alias) = split_alias(c);
            if col == "*" {
                continue;
            }
            let v = key.get(bare(col)).cloned().unwrap_or(Value::Null);
            row.insert(alias.unwrap_or(bare(col)).to_string(), v);
        }
        for agg in &q.aggregates {
            row.insert(agg.alias.clone(), fold(agg, &members));
        }
        if matches(db, &row, &q.having)? {
            out.push(row);
        }
    }
    Ok(out)
}

fn fold(agg: &Aggregate, rows: &[Row]) -> Value {
    if agg.column == "*" {
        return Value::from(rows.len() as u64);
    }
    let values: Vec<&Value> = rows
        .iter()
        .filter_map(|r| r.get(bare(&agg.column)))
        .filter(|v| !v.is_null())
        .collect();
    match agg.func {
        AggregateFn::Count => Value::from(values.len() as u64),
        AggregateFn::Min => values
            .into_iter()
            .min_by(|a, b| order_values(Some(a), Some(b)))
            .cloned()
            .unwrap_or(Value::Null),
        AggregateFn::Max => values
            .into_iter()
            .max_by(|a, b| order_values(Some(a), Some(b)))
            .cloned()
            .unwrap_or(Value::Null),
        AggregateFn::Sum | AggregateFn::Avg => {
            let nums: Vec<f64> = values.iter().filter_map(|v| as_f64(v)).collect();
            if nums.is_empty() {
                return Value::Null;
            }
            let total: f64 = nums.iter().sum();
            let all_int = values.iter().all(|v| v.as_i64().is_some());
            if agg.func == AggregateFn::Sum && all_int {
                Value::from(total as i64)
            } else {
                let n = if agg.func == AggregateFn::Avg { total / nums.len() as f64 } else { total };
                Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
            }
        }
    }
}

fn insert(db: &mut Db, q: &Query) -> Result<QueryOutput, AppError> {
    let table = db.tables.entry(q.table.clone()).or_default();
    let mut inserted = Vec::with_capacity(q.values.len());
    for values in &q.values {
        let mut row = values.clone();
        if let Some((col, last)) = &mut table.serial {
            let given = row.get(col.as_str()).and_then(Value::as_i64);
            match given {
                Some(n) => *last = (*last).max(n),
                None => {
                    *last += 1;
                    row.insert(col.clone(), Value::from(*last));
                }
            }
        }
        table.rows.push(row.clone());
        inserted.push(row);
    }
    Ok(returning(q, inserted))
}

fn update(db: &mut Db, q: &Query) -> Result<QueryOutput, AppError> {
    let mut rows = match db.tables.get(&q.table) {
        Some(t) => t.rows.clone(),
        None => return Ok(returning(q, Vec::new())),
    };
    let mut changed = Vec::new();
    for row in rows.iter_mut() {
        if matches(db, row, &q.wheres)? {
            for (k, v) in &q.set {
                row.insert(k.clone(), v.clone());
            }
            changed.push(row.clone());
        }
    }
    if let Some(t) = db.tables.get_mut(&q.table) {
        t.rows = rows;
    }
    Ok(returning(q, changed))
}

fn delete(db: &mut Db, q: &Query) -> Result<QueryOutput, AppError> {
    let rows = match db.tables.get(&q.table) {
        Some(t) => t.rows.clone(),
        None => return Ok(returning(q, Vec::new())),
    };
    let mut kept = Vec::with_capacity(rows.len());
    let mut removed = Vec::new();
    for row in rows {
        if matches(db, &row, &q.wheres)? {
            removed.push(row);
        } else {
            kept.push(row);
        }
    }
    if let Some(t) = db.tables.get_mut(&q.table) {
        t.rows = kept;
    }
    Ok(returning(q, removed))
}

fn returning(q: &Query, rows: Vec<Row>) -> QueryOutput {
    if q.returning.is_empty() {
        QueryOutput::Affected(rows.len() as u64)
    } else {
        QueryOutput::Rows(rows.iter().map(|r| project(r, &q.returning)).collect())
    }
}

/// AND binds tighter than OR: clauses split into runs at each `Or`, each run
/// is a conjunction and the runs are or-ed together.
fn matches(db: &Db, row: &Row, clauses: &[WhereClause]) -> Result<bool, AppError> {
    let mut any = false;
    let mut run = true;
    for (i, clause) in clauses.iter().enumerate() {
        if i > 0 && clause.conj == Conj::Or {
            any |= run;
            run = true;
        }
        if run {
            run = condition(db, row, &clause.condition)?;
        }
    }
    Ok(any || run)
}

fn first_column(rows: Vec<Row>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|r| r.into_iter().next().map(|(_, v)| v))
        .collect()
}

fn condition(db: &Db, row: &Row, c: &Condition) -> Result<bool, AppError> {
    let get = |col: &str| row.get(bare(col)).unwrap_or(&Value::Null).clone();
    Ok(match c {
        Condition::Compare { column, op, value } => {
            let rhs = match value {
                Operand::Value(v) => v.clone(),
                Operand::Sub(sub) => first_column(select(db, sub)?).into_iter().next().unwrap_or(Value::Null),
            };
            compare(&get(column), *op, &rhs)?
        }
        Condition::In { column, source, negated } => {
            let values = match source {
                InSource::List(v) => v.clone(),
                InSource::Sub(sub) => first_column(select(db, sub)?),
            };
            let lhs = get(column);
            if lhs.is_null() {
                false
            } else {
                let found = values.iter().any(|v| loose_cmp(&lhs, v) == Some(Ordering::Equal));
                found != *negated
            }
        }
        Condition::Null { column, negated } => get(column).is_null() != *negated,
        Condition::Between { column, low, high, negated } => {
            let v = get(column);
            let inside = matches!(loose_cmp(&v, low), Some(Ordering::Greater | Ordering::Equal))
                && matches!(loose_cmp(&v, high), Some(Ordering::Less | Ordering::Equal));
            !v.is_null() && inside != *negated
        }
        Condition::Exists { query, negated } => select(db, query)?.is_empty() == *negated,
        Condition::Raw { .. } => {
            return Err(AppError::Backend("raw conditions are not supported by the memory backend".into()))
        }
        Condition::Group(inner) => matches(db, row, inner)?,
    })
}

fn compare(lhs: &Value, op: CompareOp, rhs: &Value) -> Result<bool, AppError> {
    if lhs.is_null() || rhs.is_null() {
        return Ok(false);
    }
    Ok(match op {
        CompareOp::Like | CompareOp::ILike => {
            let text = match lhs {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let pattern = rhs.as_str().unwrap_or_default();
            like_regex(pattern, op == CompareOp::ILike)?.is_match(&text)
        }
        _ => {
            let ord = loose_cmp(lhs, rhs);
            match op {
                CompareOp::Eq => ord == Some(Ordering::Equal),
                CompareOp::Ne => matches!(ord, Some(Ordering::Less | Ordering::Greater)),
                CompareOp::Lt => ord == Some(Ordering::Less),
                CompareOp::Lte => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
                CompareOp::Gt => ord == Some(Ordering::Greater),
                CompareOp::Gte => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
                CompareOp::Like | CompareOp::ILike => false,
            }
        }
    })
}

fn like_regex(pattern: &str, case_insensitive: bool) -> Result<Regex, AppError> {
    let mut re = String::from(if case_insensitive { "(?is)^" } else { "(?s)^" });
    for ch in pattern.chars() {
        match ch {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| AppError::Backend(format!("bad LIKE pattern: {}", e)))
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Comparison with the coercions a PostgreSQL parameter would get: numeric
/// strings against numbers, `"true"`/`"false"` against booleans.
fn loose_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(_), _) | (_, Value::Bool(_)) => {
            let (x, y) = (as_bool(a)?, as_bool(b)?);
            Some(x.cmp(&y))
        }
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            let (x, y) = (as_f64(a)?, as_f64(b)?);
            x.partial_cmp(&y)
        }
        _ => (a == b).then_some(Ordering::Equal),
    }
}

/// Total order for sorting; nulls last.
fn order_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => loose_cmp(x, y).unwrap_or_else(|| x.to_string().cmp(&y.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn filter(column: &str, op: CompareOp, v: Value) -> WhereClause {
        WhereClause {
            conj: Conj::And,
            condition: Condition::Compare {
                column: column.into(),
                op,
                value: Operand::Value(v),
            },
        }
    }

    async fn seeded() -> MemoryBackend {
        let b = MemoryBackend::new();
        let mut q = Query::new("users");
        q.op = Operation::Insert;
        q.values = vec![
            row(json!({"id": 1, "name": "ann", "admin": true, "age": 30})),
            row(json!({"id": 2, "name": "bob", "admin": false, "age": 20})),
            row(json!({"id": 3, "name": "Bea", "admin": false, "age": null})),
        ];
        b.execute(&q, None).await.unwrap();
        b
    }

    #[tokio::test]
    async fn filters_coerce_stringified_booleans_and_numbers() {
        let b = seeded().await;
        let mut q = Query::new("users");
        q.wheres.push(filter("admin", CompareOp::Eq, json!("false")));
        q.wheres.push(filter("id", CompareOp::Gte, json!("3")));
        let rows = b.execute(&q, None).await.unwrap().into_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], "Bea");
    }

    #[tokio::test]
    async fn like_and_ilike() {
        let b = seeded().await;
        let mut q = Query::new("users");
        q.wheres.push(filter("name", CompareOp::ILike, json!("b%")));
        assert_eq!(b.execute(&q, None).await.unwrap().into_rows().len(), 2);
        let mut q = Query::new("users");
        q.wheres.push(filter("name", CompareOp::Like, json!("b_b")));
        assert_eq!(b.execute(&q, None).await.unwrap().into_rows().len(), 1);
    }

    #[tokio::test]
    async fn aggregates_skip_nulls() {
        let b = seeded().await;
        let mut q = Query::new("users");
        q.aggregates.push(Aggregate {
            func: AggregateFn::Count,
            column: "age".into(),
            alias: "n".into(),
        });
        q.aggregates.push(Aggregate {
            func: AggregateFn::Max,
            column: "id".into(),
            alias: "max".into(),
        });
        let rows = b.execute(&q, None).await.unwrap().into_rows();
        assert_eq!(rows[0]["n"], json!(2));
        assert_eq!(rows[0]["max"], json!(3));
    }

    #[tokio::test]
    async fn rollback_restores_rows() {
        let b = seeded().await;
        let tx = b.begin().await.unwrap();
        let mut q = Query::new("users");
        q.op = Operation::Delete;
        assert!(matches!(b.execute(&q, Some(tx)).await.unwrap(), QueryOutput::Affected(3)));
        b.rollback(tx).await.unwrap();
        assert_eq!(b.rows("users").len(), 3);
        assert!(b.commit(tx).await.is_err());
    }

    #[tokio::test]
    async fn serial_column_is_assigned_on_insert() {
        let b = MemoryBackend::new();
        b.sync_table(&TableDef {
            schema: "public".into(),
            name: "posts".into(),
            primary_key: "id".into(),
            columns: vec![crate::store::ColumnDef {
                name: "id".into(),
                pg_type: "integer",
                nullable: false,
                default: None,
                auto_increment: true,
            }],
        })
        .await
        .unwrap();
        let mut q = Query::new("posts");
        q.op = Operation::Insert;
        q.values = vec![row(json!({"title": "a"})), row(json!({"title": "b"}))];
        q.returning = vec!["*".into()];
        let rows = b.execute(&q, None).await.unwrap().into_rows();
        assert_eq!(rows[0]["id"], json!(1));
        assert_eq!(rows[1]["id"], json!(2));
    }

    #[tokio::test]
    async fn and_binds_tighter_than_or() {
        let b = MemoryBackend::new();
        let mut q = Query::new("flags");
        q.op = Operation::Insert;
        q.values = vec![row(json!({"a": 1, "b": 2, "c": 0, "d": 0}))];
        b.execute(&q, None).await.unwrap();

        // a = 1 AND b = 2 OR c = 3 AND d = 4
        let mut q = Query::new("flags");
        q.wheres.push(filter("a", CompareOp::Eq, json!(1)));
        q.wheres.push(filter("b", CompareOp::Eq, json!(2)));
        let mut c = filter("c", CompareOp::Eq, json!(3));
        c.conj = Conj::Or;
        q.wheres.push(c);
        q.wheres.push(filter("d", CompareOp::Eq, json!(4)));
        assert_eq!(b.execute(&q, None).await.unwrap().into_rows().len(), 1);

        // a = 0 OR b = 2 AND c = 0
        let mut q = Query::new("flags");
        q.wheres.push(filter("a", CompareOp::Eq, json!(0)));
        let mut c = filter("b", CompareOp::Eq, json!(2));
        c.conj = Conj::Or;
        q.wheres.push(c);
        q.wheres.push(filter("c", CompareOp::Eq, json!(0)));
        assert_eq!(b.execute(&q, None).await.unwrap().into_rows().len(), 1);

        // a = 0 OR b = 2 AND c = 3
        let mut q = Query::new("flags");
        q.wheres.push(filter("a", CompareOp::Eq, json!(0)));
        let mut c = filter("b", CompareOp::Eq, json!(2));
        c.conj = Conj::Or;
        q.wheres.push(c);
        q.wheres.push(filter("c", CompareOp::Eq, json!(3)));
        assert!(b.execute(&q, None).await.unwrap().into_rows().is_empty());
    }

    #[tokio::test]
    async fn joins_are_rejected() {
        let b = MemoryBackend::new();
        let mut q = Query::new("users");
        q.joins.push(Join {
            kind: JoinKind::Cross,
            table: "posts".into(),
            on: None,
        });
        assert!(matches!(b.execute(&q, None).await, Err(AppError::Backend(_))));
    }
}
