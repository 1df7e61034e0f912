use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{
    postgres::{PgPool, PgPoolOptions, PgRow},
    Column, Decode, Postgres, Row, Type, TypeInfo,
};
use time::format_description::well_known::Rfc3339;

use crate::telemetry;

/**
 * \brief 执行原始 SQL，并以 JSON 对象数组返回结果行。
 */
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<Vec<Value>>;
}

/**
 * \brief 基于惰性连接池的 Postgres 执行器。
 */
#[derive(Clone)]
pub struct PgExecutor {
    pool: PgPool,
}

impl PgExecutor {
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl QueryExecutor for PgExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<Value>> {
        let statement = normalize_statement(sql);
        if statement.is_empty() {
            return Err(anyhow!("No SQL query to execute"));
        }
        let outcome = match classify(&statement) {
            StatementKind::Query => sqlx::query_scalar::<_, Value>(&wrap_as_json(&statement))
                .fetch_one(&self.pool)
                .await
                .map(|v| match v {
                    Value::Array(rows) => rows,
                    Value::Null => Vec::new(),
                    other => vec![other],
                }),
            StatementKind::Rows => sqlx::query(&statement)
                .fetch_all(&self.pool)
                .await
                .map(|rows| rows.iter().map(row_to_json).collect()),
            StatementKind::Command => sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map(|_| Vec::new()),
        };
        match outcome {
            Ok(rows) => {
                telemetry::log_event("executor", &format!("rows={}", rows.len()));
                Ok(rows)
            }
            Err(err) => {
                telemetry::log_error("executor", &err.to_string());
                Err(anyhow!("Failed to execute SQL query"))
            }
        }
    }
}

/**
 * \brief 语句的执行方式。
 * \details `Query` 可放进子查询由 `json_agg` 聚合；`Rows` 会返回行但不能嵌套
 * （EXPLAIN、SHOW、RETURNING、含写操作的 WITH），逐列转换；`Command` 不返回行。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatementKind {
    Query,
    Rows,
    Command,
}

fn classify(statement: &str) -> StatementKind {
    let words = scan(statement).words;
    let has = |kw: &str| words.iter().any(|w| w == kw);
    match words.first().map(String::as_str) {
        Some("select" | "values" | "table") => StatementKind::Query,
        Some("with") => {
            if ["insert", "update", "delete", "merge"].iter().any(|kw| has(*kw)) {
                StatementKind::Rows
            } else {
                StatementKind::Query
            }
        }
        Some("explain" | "show") => StatementKind::Rows,
        _ if has("returning") => StatementKind::Rows,
        _ => StatementKind::Command,
    }
}

/* 去掉尾部的分号、空白和注释，否则会落进 json_agg 子查询。 */
fn normalize_statement(sql: &str) -> String {
    sql[..scan(sql).end].trim().to_string()
}

struct Scanned {
    /** \brief 字符串、引号标识符与注释之外的小写单词。 */
    words: Vec<String>,
    /** \brief 最后一个有效字符之后的字节偏移。 */
    end: usize,
}

fn scan(sql: &str) -> Scanned {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut end = 0;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c.is_alphanumeric() || c == '_' {
            word.push(c.to_ascii_lowercase());
            end = i + c.len_utf8();
            continue;
        }
        if !word.is_empty() {
            words.push(std::mem::take(&mut word));
        }
        let next = chars.peek().map(|&(_, n)| n);
        match c {
            '-' if next == Some('-') => {
                for (_, n) in chars.by_ref() {
                    if n == '\n' {
                        break;
                    }
                }
            }
            '/' if next == Some('*') => {
                chars.next();
                let mut depth = 1;
                while let Some((_, n)) = chars.next() {
                    let after = chars.peek().map(|&(_, m)| m);
                    if n == '*' && after == Some('/') {
                        chars.next();
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    } else if n == '/' && after == Some('*') {
                        chars.next();
                        depth += 1;
                    }
                }
            }
            '\'' | '"' => {
                end = i + 1;
                while let Some((j, n)) = chars.next() {
                    end = j + n.len_utf8();
                    if n != c {
                        continue;
                    }
                    match chars.peek() {
                        Some(&(k, m)) if m == c => {
                            chars.next();
                            end = k + m.len_utf8();
                        }
                        _ => break,
                    }
                }
            }
            ';' => {}
            _ if c.is_whitespace() => {}
            _ => end = i + c.len_utf8(),
        }
    }
    if !word.is_empty() {
        words.push(word);
    }
    Scanned { words, end }
}

fn wrap_as_json(statement: &str) -> String {
    format!(
        "SELECT COALESCE(json_agg(q), '[]'::json) FROM (\n{}\n) AS q",
        statement
    )
}

/**
 * \brief 按列名把一行转换为 JSON 对象。
 * \details 无法解码的列类型（如 NUMERIC）输出为 null。
 */
fn row_to_json(row: &PgRow) -> Value {
    let mut object = Map::new();
    for column in row.columns() {
        let value = column_value(row, column.ordinal(), column.type_info().name());
        object.insert(column.name().to_string(), value);
    }
    Value::Object(object)
}

fn column_value(row: &PgRow, idx: usize, type_name: &str) -> Value {
    let value = match type_name {
        "BOOL" => decode::<bool>(row, idx).map(Value::from),
        "INT2" => decode::<i16>(row, idx).map(Value::from),
        "INT4" => decode::<i32>(row, idx).map(Value::from),
        "INT8" => decode::<i64>(row, idx).map(Value::from),
        "FLOAT4" => decode::<f32>(row, idx).map(Value::from),
        "FLOAT8" => decode::<f64>(row, idx).map(Value::from),
        "JSON" | "JSONB" => decode::<Value>(row, idx),
        "UUID" => decode::<uuid::Uuid>(row, idx).map(|u| Value::from(u.to_string())),
        "TIMESTAMPTZ" => decode::<time::OffsetDateTime>(row, idx)
            .and_then(|t| t.format(&Rfc3339).ok())
            .map(Value::from),
        "TIMESTAMP" => {
            decode::<time::PrimitiveDateTime>(row, idx).map(|t| Value::from(t.to_string()))
        }
        "DATE" => decode::<time::Date>(row, idx).map(|d| Value::from(d.to_string())),
        _ => decode::<String>(row, idx).map(Value::from),
    };
    value.unwrap_or(Value::Null)
}

fn decode<'r, T>(row: &'r PgRow, idx: usize) -> Option<T>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get::<Option<T>, _>(idx).ok().flatten()
}
