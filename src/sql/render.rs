//! Renders a `Query` to parameterized PostgreSQL: quoted identifiers, values as `$n` parameters.

use crate::sql::query::*;
use serde_json::Value;

pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<Value>,
}

impl QueryBuf {
    fn new() -> Self {
        QueryBuf {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push_param(&mut self, v: Value) -> u32 {
        let n = self.params.len() as u32 + 1;
        self.params.push(v);
        n
    }
}

/// Quote identifier for PostgreSQL. `table.column` is quoted per part, `*` is left alone.
pub fn quoted(s: &str) -> String {
    s.split('.')
        .map(|part| {
            if part == "*" {
                part.to_string()
            } else {
                format!("\"{}\"", part.replace('"', "\"\""))
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Split `col as alias` (case-insensitive) into its parts.
pub fn split_alias(s: &str) -> (&str, Option<&str>) {
    let lower = s.to_ascii_lowercase();
    match lower.find(" as ") {
        Some(i) => (s[..i].trim(), Some(s[i + 4..].trim())),
        None => (s.trim(), None),
    }
}

fn column_expr(s: &str) -> String {
    match split_alias(s) {
        (col, Some(alias)) => format!("{} AS {}", quoted(col), quoted(alias)),
        (col, None) => quoted(col),
    }
}

fn qualified_table(q: &Query) -> String {
    match &q.schema {
        Some(schema) => format!("{}.{}", quoted(schema), quoted(&q.table)),
        None => quoted(&q.table),
    }
}

/// Render the full statement.
pub fn to_sql(q: &Query) -> QueryBuf {
    let mut buf = QueryBuf::new();
    let sql = statement(&mut buf, q);
    buf.sql = sql;
    buf
}

fn placeholder(buf: &mut QueryBuf, q: &Query, column: &str, v: Value) -> String {
    let n = buf.push_param(v);
    let bare = column.rsplit('.').next().unwrap_or(column);
    match q.casts.get(bare) {
        Some(t) => format!("${}::{}", n, t),
        None => format!("${}", n),
    }
}

fn statement(buf: &mut QueryBuf, q: &Query) -> String {
    match q.op {
        Operation::Select => select(buf, q),
        Operation::Insert => insert(buf, q),
        Operation::Update => update(buf, q),
        Operation::Delete => delete(buf, q),
    }
}

fn select(buf: &mut QueryBuf, q: &Query) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !q.selects_all() {
        parts.extend(q.columns.iter().map(|c| column_expr(c)));
    } else if q.aggregates.is_empty() {
        parts.push("*".into());
    }
    for agg in &q.aggregates {
        let target = if agg.column == "*" { "*".to_string() } else { quoted(&agg.column) };
        parts.push(format!("{}({}) AS {}", agg.func.name(), target, quoted(&agg.alias)));
    }
    let mut sql = format!(
        "SELECT {}{} FROM {}",
        if q.distinct { "DISTINCT " } else { "" },
        parts.join(", "),
        qualified_table(q)
    );
    for j in &q.joins {
        let kind = match j.kind {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Cross => "CROSS JOIN",
        };
        match &j.on {
            Some((left, op, right)) => sql.push_str(&format!(
                " {} {} ON {} {} {}",
                kind,
                quoted(&j.table),
                quoted(left),
                op,
                quoted(right)
            )),
            None => sql.push_str(&format!(" {} {}", kind, quoted(&j.table))),
        }
    }
    push_where(buf, q, &mut sql);
    if !q.group_by.is_empty() {
        let cols: Vec<String> = q.group_by.iter().map(|c| quoted(c)).collect();
        sql.push_str(&format!(" GROUP BY {}", cols.join(", ")));
    }
    if !q.having.is_empty() {
        let having = clauses(buf, q, &q.having);
        sql.push_str(&format!(" HAVING {}", having));
    }
    if !q.order.is_empty() {
        let cols: Vec<String> = q
            .order
            .iter()
            .map(|(c, d)| {
                format!(
                    "{} {}",
                    quoted(c),
                    if *d == Direction::Desc { "DESC" } else { "ASC" }
                )
            })
            .collect();
        sql.push_str(&format!(" ORDER BY {}", cols.join(", ")));
    }
    if let Some(n) = q.limit {
        sql.push_str(&format!(" LIMIT {}", n));
    }
    if let Some(n) = q.offset {
        sql.push_str(&format!(" OFFSET {}", n));
    }
    sql
}

fn insert(buf: &mut QueryBuf, q: &Query) -> String {
    let table = qualified_table(q);
    let mut cols: Vec<&String> = Vec::new();
    for row in &q.values {
        for k in row.keys() {
            if !cols.contains(&k) {
                cols.push(k);
            }
        }
    }
    let mut sql = if cols.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", table)
    } else {
        let mut tuples = Vec::with_capacity(q.values.len());
        for row in &q.values {
            let phs: Vec<String> = cols
                .iter()
                .map(|c| match row.get(*c) {
                    Some(v) => placeholder(buf, q, c, v.clone()),
                    None => "DEFAULT".to_string(),
                })
                .collect();
            tuples.push(format!("({})", phs.join(", ")));
        }
        let quoted_cols: Vec<String> = cols.iter().map(|c| quoted(c)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES {}",
            table,
            quoted_cols.join(", "),
            tuples.join(", ")
        )
    };
    push_returning(q, &mut sql);
    sql
}

fn update(buf: &mut QueryBuf, q: &Query) -> String {
    let sets: Vec<String> = q
        .set
        .iter()
        .map(|(k, v)| format!("{} = {}", quoted(k), placeholder(buf, q, k, v.clone())))
        .collect();
    let mut sql = format!("UPDATE {} SET {}", qualified_table(q), sets.join(", "));
    push_where(buf, q, &mut sql);
    push_returning(q, &mut sql);
    sql
}

fn delete(buf: &mut QueryBuf, q: &Query) -> String {
    let mut sql = format!("DELETE FROM {}", qualified_table(q));
    push_where(buf, q, &mut sql);
    push_returning(q, &mut sql);
    sql
}

fn push_where(buf: &mut QueryBuf, q: &Query, sql: &mut String) {
    if !q.wheres.is_empty() {
        let w = clauses(buf, q, &q.wheres);
        sql.push_str(&format!(" WHERE {}", w));
    }
}

fn push_returning(q: &Query, sql: &mut String) {
    if !q.returning.is_empty() {
        let cols: Vec<String> = q.returning.iter().map(|c| quoted(c)).collect();
        sql.push_str(&format!(" RETURNING {}", cols.join(", ")));
    }
}

fn clauses(buf: &mut QueryBuf, q: &Query, list: &[WhereClause]) -> String {
    let mut out = String::new();
    for (i, clause) in list.iter().enumerate() {
        if i > 0 {
            out.push_str(match clause.conj {
                Conj::And => " AND ",
                Conj::Or => " OR ",
            });
        }
        out.push_str(&condition(buf, q, &clause.condition));
    }
    out
}

fn subquery(buf: &mut QueryBuf, sub: &Query) -> String {
    format!("({})", statement(buf, sub))
}

fn condition(buf: &mut QueryBuf, q: &Query, c: &Condition) -> String {
    match c {
        Condition::Compare { column, op, value } => {
            let rhs = match value {
                Operand::Value(v) => placeholder(buf, q, column, v.clone()),
                Operand::Sub(sub) => subquery(buf, sub),
            };
            format!("{} {} {}", quoted(column), op.as_sql(), rhs)
        }
        Condition::In { column, source, negated } => {
            let not = if *negated { "NOT " } else { "" };
            match source {
                InSource::List(values) if values.is_empty() => {
                    if *negated { "1 = 1".into() } else { "1 = 0".into() }
                }
                InSource::List(values) => {
                    let phs: Vec<String> = values
                        .iter()
                        .map(|v| placeholder(buf, q, column, v.clone()))
                        .collect();
                    format!("{} {}IN ({})", quoted(column), not, phs.join(", "))
                }
                InSource::Sub(sub) => format!("{} {}IN {}", quoted(column), not, subquery(buf, sub)),
            }
        }
        Condition::Null { column, negated } => {
            format!("{} IS {}NULL", quoted(column), if *negated { "NOT " } else { "" })
        }
        Condition::Between { column, low, high, negated } => {
            let lo = placeholder(buf, q, column, low.clone());
            let hi = placeholder(buf, q, column, high.clone());
            format!(
                "{} {}BETWEEN {} AND {}",
                quoted(column),
                if *negated { "NOT " } else { "" },
                lo,
                hi
            )
        }
        Condition::Exists { query, negated } => {
            format!("{}EXISTS {}", if *negated { "NOT " } else { "" }, subquery(buf, query))
        }
        Condition::Raw { sql, bindings } => {
            let mut out = String::with_capacity(sql.len());
            let mut bindings = bindings.iter();
            for ch in sql.chars() {
                if ch == '?' {
                    if let Some(v) = bindings.next() {
                        let n = buf.push_param(v.clone());
                        out.push_str(&format!("${}", n));
                        continue;
                    }
                }
                out.push(ch);
            }
            out
        }
        Condition::Group(inner) => format!("({})", clauses(buf, q, inner)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn where_eq(q: &mut Query, col: &str, v: Value) {
        q.wheres.push(WhereClause {
            conj: Conj::And,
            condition: Condition::Compare {
                column: col.into(),
                op: CompareOp::Eq,
                value: Operand::Value(v),
            },
        });
    }

    #[test]
    fn select_with_where_order_limit() {
        let mut q = Query::new("users");
        where_eq(&mut q, "name", json!("ann"));
        q.order.push(("id".into(), Direction::Desc));
        q.limit = Some(10);
        q.offset = Some(20);
        let buf = to_sql(&q);
        assert_eq!(
            buf.sql,
            r#"SELECT * FROM "users" WHERE "name" = $1 ORDER BY "id" DESC LIMIT 10 OFFSET 20"#
        );
        assert_eq!(buf.params, vec![json!("ann")]);
    }

    #[test]
    fn casts_follow_column_types() {
        let mut q = Query::new("users");
        q.casts.insert("created_at".into(), "timestamptz");
        where_eq(&mut q, "created_at", json!("2024-01-01T00:00:00Z"));
        assert_eq!(to_sql(&q).sql, r#"SELECT * FROM "users" WHERE "created_at" = $1::timestamptz"#);
    }

    #[test]
    fn subselect_params_continue_numbering() {
        let mut sub = Query::new("orders");
        sub.columns.push("user_id".into());
        where_eq(&mut sub, "total", json!(5));
        let mut q = Query::new("users");
        where_eq(&mut q, "active", json!("true"));
        q.wheres.push(WhereClause {
            conj: Conj::Or,
            condition: Condition::In {
                column: "id".into(),
                source: InSource::Sub(Box::new(sub)),
                negated: false,
            },
        });
        let buf = to_sql(&q);
        assert_eq!(
            buf.sql,
            r#"SELECT * FROM "users" WHERE "active" = $1 OR "id" IN (SELECT "user_id" FROM "orders" WHERE "total" = $2)"#
        );
        assert_eq!(buf.params.len(), 2);
    }

    #[test]
    fn aggregate_replaces_star() {
        let mut q = Query::new("users");
        q.aggregates.push(Aggregate {
            func: AggregateFn::Max,
            column: "id".into(),
            alias: "max".into(),
        });
        assert_eq!(to_sql(&q).sql, r#"SELECT max("id") AS "max" FROM "users""#);
    }

    #[test]
    fn insert_fills_missing_columns_with_default() {
        let mut q = Query::new("users");
        q.op = Operation::Insert;
        q.values.push(json!({"name": "a", "age": 3}).as_object().cloned().unwrap());
        q.values.push(json!({"name": "b"}).as_object().cloned().unwrap());
        q.returning.push("*".into());
        let buf = to_sql(&q);
        assert_eq!(
            buf.sql,
            r#"INSERT INTO "users" ("age", "name") VALUES ($1, $2), (DEFAULT, $3) RETURNING *"#
        );
    }

    #[test]
    fn raw_bindings_become_placeholders() {
        let mut q = Query::new("users");
        q.op = Operation::Delete;
        q.wheres.push(WhereClause {
            conj: Conj::And,
            condition: Condition::Raw {
                sql: "age > ? and age < ?".into(),
                bindings: vec![json!(1), json!(9)],
            },
        });
        assert_eq!(to_sql(&q).sql, r#"DELETE FROM "users" WHERE age > $1 and age < $2"#);
    }

    #[test]
    fn qualified_identifiers_and_aliases() {
        assert_eq!(quoted("users.id"), r#""users"."id""#);
        assert_eq!(column_expr("name AS n"), r#""name" AS "n""#);
    }
}
