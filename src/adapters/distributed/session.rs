//! Contract of a session with the globally distributed engine.
//!
//! Queries are structured rather than textual: the adapter describes the
//! table, key range, predicates and projection, and the engine evaluates them
//! at a timestamp chosen from a [`TimestampBound`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("table `{0}` not found")]
    TableNotFound(String),
    #[error("column `{column}` not found in table `{table}`")]
    ColumnNotFound { table: String, column: String },
    #[error("row already exists in table `{table}`")]
    AlreadyExists { table: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("read timestamp {0} is in the future")]
    FutureTimestamp(DateTime<Utc>),
    #[error("column {index}: {reason}")]
    Decode { index: usize, reason: String },
    #[error("INT64 overflow in {0}")]
    Overflow(&'static str),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// A single cell. Variant order defines the sort order of keys (NULL first).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Timestamp(DateTime<Utc>),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn bytes(data: impl AsRef<[u8]>) -> Self {
        Self::Bytes(data.as_ref().to_vec())
    }

    pub fn nullable_bytes(data: Option<&Vec<u8>>) -> Self {
        data.map_or(Self::Null, |d| Self::Bytes(d.clone()))
    }

    pub fn nullable_timestamp(at: Option<DateTime<Utc>>) -> Self {
        at.map_or(Self::Null, Self::Timestamp)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// One result row, columns in the order of the query projection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row(pub Vec<Value>);

impl Row {
    fn cell(&self, index: usize) -> SessionResult<&Value> {
        self.0.get(index).ok_or_else(|| SessionError::Decode {
            index,
            reason: format!("row has only {} columns", self.0.len()),
        })
    }

    fn mismatch(index: usize, want: &str, got: &Value) -> SessionError {
        SessionError::Decode {
            index,
            reason: format!("want {want}, got {got:?}"),
        }
    }

    pub fn int64(&self, index: usize) -> SessionResult<i64> {
        match self.cell(index)? {
            Value::Int64(v) => Ok(*v),
            other => Err(Self::mismatch(index, "INT64", other)),
        }
    }

    pub fn string(&self, index: usize) -> SessionResult<String> {
        match self.cell(index)? {
            Value::String(v) => Ok(v.clone()),
            other => Err(Self::mismatch(index, "STRING", other)),
        }
    }

    pub fn bytes(&self, index: usize) -> SessionResult<Vec<u8>> {
        match self.cell(index)? {
            Value::Bytes(v) => Ok(v.clone()),
            other => Err(Self::mismatch(index, "BYTES", other)),
        }
    }

    pub fn nullable_bytes(&self, index: usize) -> SessionResult<Option<Vec<u8>>> {
        match self.cell(index)? {
            Value::Null => Ok(None),
            _ => self.bytes(index).map(Some),
        }
    }

    pub fn timestamp(&self, index: usize) -> SessionResult<DateTime<Utc>> {
        match self.cell(index)? {
            Value::Timestamp(v) => Ok(*v),
            other => Err(Self::mismatch(index, "TIMESTAMP", other)),
        }
    }

    pub fn nullable_timestamp(&self, index: usize) -> SessionResult<Option<DateTime<Utc>>> {
        match self.cell(index)? {
            Value::Null => Ok(None),
            _ => self.timestamp(index).map(Some),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    Int64,
    Timestamp,
    String,
    Bytes,
}

#[derive(Clone, Debug)]
pub struct ColumnSchema {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    /// Fill the column from this sequence when an insert leaves it out.
    pub default_sequence: Option<&'static str>,
}

impl ColumnSchema {
    pub const fn required(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
            default_sequence: None,
        }
    }

    pub const fn nullable(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: true,
            default_sequence: None,
        }
    }

    pub const fn from_sequence(name: &'static str, sequence: &'static str) -> Self {
        Self {
            name,
            ty: ColumnType::Int64,
            nullable: false,
            default_sequence: Some(sequence),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TableSchema {
    pub name: &'static str,
    pub columns: Vec<ColumnSchema>,
    pub primary_key: Vec<&'static str>,
}

/// Inclusive bounds on a prefix of the primary key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Vec<Value>,
    pub end: Vec<Value>,
}

impl KeyRange {
    pub fn contains(&self, key: &[Value]) -> bool {
        let start_len = self.start.len().min(key.len());
        let end_len = self.end.len().min(key.len());
        &key[..start_len] >= self.start.as_slice() && &key[..end_len] <= self.end.as_slice()
    }
}

/// Projected expression. Aggregates are only valid in grouped queries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    Column(&'static str),
    /// `COALESCE(LENGTH(column), 0)`
    Length(&'static str),
    Add(Vec<Expr>),
    Sum(Box<Expr>),
    Count,
    /// `COUNTIF(column = value)`
    CountIf(&'static str, Value),
}

impl Expr {
    pub fn sum(expr: Expr) -> Self {
        Self::Sum(Box::new(expr))
    }

    pub fn is_aggregate(&self) -> bool {
        match self {
            Self::Sum(_) | Self::Count | Self::CountIf(..) => true,
            Self::Add(parts) => parts.iter().any(Expr::is_aggregate),
            Self::Column(_) | Self::Length(_) => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    /// `column IS NULL OR column > value`
    NullOrGreater(&'static str, Value),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub table: &'static str,
    pub select: Vec<Expr>,
    pub range: Option<KeyRange>,
    pub predicates: Vec<Predicate>,
    /// Grouped results come back ordered by the group key.
    pub group_by: Vec<&'static str>,
}

impl Query {
    pub fn table(table: &'static str) -> Self {
        Self {
            table,
            select: Vec::new(),
            range: None,
            predicates: Vec::new(),
            group_by: Vec::new(),
        }
    }

    pub fn columns(mut self, columns: &[&'static str]) -> Self {
        self.select = columns.iter().copied().map(Expr::Column).collect();
        self
    }

    pub fn select(mut self, exprs: Vec<Expr>) -> Self {
        self.select = exprs;
        self
    }

    pub fn range(mut self, range: KeyRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn group_by(mut self, columns: &[&'static str]) -> Self {
        self.group_by = columns.to_vec();
        self
    }

    /// Whether the engine can split this query into independent partitions.
    pub fn is_partitionable(&self) -> bool {
        self.group_by.is_empty() && !self.select.iter().any(Expr::is_aggregate)
    }
}

/// Which timestamp a read observes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimestampBound {
    Strong,
    ReadTimestamp(DateTime<Utc>),
    ExactStaleness(Duration),
    /// The engine may pick any timestamp no older than this.
    MaxStaleness(Duration),
}

/// An independently readable slice of a partitioned query, pinned to one read timestamp.
#[derive(Clone, Debug)]
pub struct Partition {
    pub query: Query,
    pub read_timestamp: DateTime<Utc>,
    pub keys: KeyRange,
}

#[derive(Clone, Debug)]
pub struct Write {
    pub table: &'static str,
    pub columns: Vec<&'static str>,
    pub values: Vec<Value>,
}

#[derive(Clone, Debug)]
pub enum Mutation {
    /// Fails the whole group if the row exists.
    Insert(Write),
    InsertOrUpdate(Write),
    /// Leaves an existing row untouched.
    InsertOrIgnore(Write),
    DeleteAll { table: &'static str },
}

impl Mutation {
    pub fn insert(table: &'static str, columns: &[&'static str], values: Vec<Value>) -> Self {
        Self::Insert(Write {
            table,
            columns: columns.to_vec(),
            values,
        })
    }

    pub fn insert_or_update(
        table: &'static str,
        columns: &[&'static str],
        values: Vec<Value>,
    ) -> Self {
        Self::InsertOrUpdate(Write {
            table,
            columns: columns.to_vec(),
            values,
        })
    }

    pub fn insert_or_ignore(
        table: &'static str,
        columns: &[&'static str],
        values: Vec<Value>,
    ) -> Self {
        Self::InsertOrIgnore(Write {
            table,
            columns: columns.to_vec(),
            values,
        })
    }
}

pub type RowStream = BoxStream<'static, SessionResult<Row>>;

/// A session with the distributed engine. One adapter owns exactly one session.
#[async_trait]
pub trait DistributedSession: Send + Sync {
    /// Creates the given tables if they do not exist yet.
    async fn update_ddl(&self, tables: Vec<TableSchema>) -> SessionResult<()>;

    /// Runs a single-use read-only query.
    async fn query(&self, query: Query, bound: TimestampBound) -> SessionResult<RowStream>;

    /// Splits a partitionable query into partitions pinned to one timestamp.
    /// `MaxStaleness` is not accepted here.
    async fn partition_query(
        &self,
        query: Query,
        bound: TimestampBound,
    ) -> SessionResult<Vec<Partition>>;

    async fn execute_partition(&self, partition: Partition) -> SessionResult<RowStream>;

    /// Applies a mutation group atomically and returns its commit timestamp.
    async fn apply(&self, mutations: Vec<Mutation>) -> SessionResult<DateTime<Utc>>;
}
