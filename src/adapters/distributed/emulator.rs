//! In-process emulator of the distributed engine.
//!
//! Keeps every committed version of every row so reads can be served at any
//! past timestamp, splits partitionable queries into contiguous key ranges,
//! and reproduces the engine's column coercions (BYTES written into a STRING
//! column are stored as their base64 text). Used by tests and by local
//! deployments configured with an `emulator://` URL.

use super::session::{
    ColumnSchema, ColumnType, DistributedSession, Expr, KeyRange, Mutation, Partition, Predicate,
    Query, Row, RowStream, SessionError, SessionResult, TableSchema, TimestampBound, Value, Write,
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

const DEFAULT_MAX_PARTITIONS: usize = 4;

type Key = Vec<Value>;

struct Version {
    committed_at: DateTime<Utc>,
    /// `None` marks a deletion.
    row: Option<Vec<Value>>,
}

struct Table {
    schema: TableSchema,
    key_columns: Vec<usize>,
    rows: BTreeMap<Key, Vec<Version>>,
}

impl Table {
    fn new(schema: TableSchema) -> SessionResult<Self> {
        let key_columns = schema
            .primary_key
            .iter()
            .map(|name| column_index(&schema, name))
            .collect::<SessionResult<_>>()?;
        Ok(Self {
            schema,
            key_columns,
            rows: BTreeMap::new(),
        })
    }

    fn visible_at(&self, key: &Key, at: DateTime<Utc>) -> Option<&Vec<Value>> {
        self.rows
            .get(key)
            .and_then(|versions| version_at(versions, at))
    }

    fn scan_at(&self, at: DateTime<Utc>) -> impl Iterator<Item = (&Key, &Vec<Value>)> {
        self.rows
            .iter()
            .filter_map(move |(key, versions)| version_at(versions, at).map(|row| (key, row)))
    }

    fn index(&self, column: &str) -> SessionResult<usize> {
        column_index(&self.schema, column)
    }
}

fn version_at(versions: &[Version], at: DateTime<Utc>) -> Option<&Vec<Value>> {
    versions
        .iter()
        .rev()
        .find(|v| v.committed_at <= at)
        .and_then(|v| v.row.as_ref())
}

fn column_index(schema: &TableSchema, column: &str) -> SessionResult<usize> {
    schema
        .columns
        .iter()
        .position(|c| c.name == column)
        .ok_or_else(|| SessionError::ColumnNotFound {
            table: schema.name.to_string(),
            column: column.to_string(),
        })
}

#[derive(Default)]
struct State {
    tables: HashMap<&'static str, Table>,
    sequences: HashMap<&'static str, i64>,
    last_commit: Option<DateTime<Utc>>,
}

impl State {
    fn table(&self, name: &str) -> SessionResult<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| SessionError::TableNotFound(name.to_string()))
    }

    fn latest(&self) -> DateTime<Utc> {
        let now = Utc::now();
        self.last_commit.map_or(now, |last| last.max(now))
    }

    fn resolve(&self, bound: TimestampBound) -> SessionResult<DateTime<Utc>> {
        let latest = self.latest();
        match bound {
            TimestampBound::Strong | TimestampBound::MaxStaleness(_) => Ok(latest),
            TimestampBound::ReadTimestamp(at) if at > latest => {
                Err(SessionError::FutureTimestamp(at))
            }
            TimestampBound::ReadTimestamp(at) => Ok(at),
            TimestampBound::ExactStaleness(staleness) => {
                let staleness = TimeDelta::from_std(staleness)
                    .map_err(|e| SessionError::InvalidArgument(e.to_string()))?;
                Ok(latest - staleness)
            }
        }
    }

    fn next_commit_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.last_commit {
            Some(last) if now <= last => last + TimeDelta::nanoseconds(1),
            _ => now,
        }
    }
}

/// Number of calls each session operation has served.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmulatorStats {
    pub queries: usize,
    pub partition_queries: usize,
    pub partition_executions: usize,
    pub applies: usize,
}

#[derive(Default)]
struct Counters {
    queries: AtomicUsize,
    partition_queries: AtomicUsize,
    partition_executions: AtomicUsize,
    applies: AtomicUsize,
}

pub struct Emulator {
    state: Mutex<State>,
    max_partitions: usize,
    counters: Counters,
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PARTITIONS)
    }
}

impl Emulator {
    pub fn new(max_partitions: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_partitions: max_partitions.max(1),
            counters: Counters::default(),
        }
    }

    /// Parses `emulator://` with an optional `partitions=N` parameter.
    pub fn from_url(url: &str) -> SessionResult<Self> {
        let rest = url
            .strip_prefix("emulator://")
            .ok_or_else(|| SessionError::InvalidArgument(format!("not an emulator url: {url}")))?;
        let mut partitions = DEFAULT_MAX_PARTITIONS;
        if let Some((_, params)) = rest.split_once('?') {
            for param in params.split('&').filter(|p| !p.is_empty()) {
                match param.split_once('=') {
                    Some(("partitions", value)) => {
                        partitions = value.parse().map_err(|_| {
                            SessionError::InvalidArgument(format!(
                                "invalid partitions value `{value}`"
                            ))
                        })?;
                    }
                    _ => {
                        return Err(SessionError::InvalidArgument(format!(
                            "unknown emulator parameter `{param}`"
                        )));
                    }
                }
            }
        }
        Ok(Self::new(partitions))
    }

    pub fn max_partitions(&self) -> usize {
        self.max_partitions
    }

    pub fn stats(&self) -> EmulatorStats {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        EmulatorStats {
            queries: load(&self.counters.queries),
            partition_queries: load(&self.counters.partition_queries),
            partition_executions: load(&self.counters.partition_executions),
            applies: load(&self.counters.applies),
        }
    }

    fn run(
        state: &State,
        query: &Query,
        at: DateTime<Utc>,
        keys: Option<&KeyRange>,
    ) -> SessionResult<Vec<Row>> {
        let table = state.table(query.table)?;
        let predicates = query
            .predicates
            .iter()
            .map(|p| match p {
                Predicate::NullOrGreater(column, value) => Ok((table.index(column)?, value)),
            })
            .collect::<SessionResult<Vec<_>>>()?;

        let matching = table.scan_at(at).filter(|(key, row)| {
            query.range.as_ref().is_none_or(|r| r.contains(key))
                && keys.is_none_or(|r| r.contains(key))
                && predicates
                    .iter()
                    .all(|(i, value)| row[*i].is_null() || &row[*i] > *value)
        });

        let grouped = !query.group_by.is_empty() || query.select.iter().any(Expr::is_aggregate);
        if !grouped {
            return matching
                .map(|(_, row)| {
                    query
                        .select
                        .iter()
                        .map(|expr| eval(table, expr, std::slice::from_ref(&row), &[]))
                        .collect::<SessionResult<Vec<_>>>()
                        .map(Row)
                })
                .collect();
        }

        let group_columns = query
            .group_by
            .iter()
            .map(|c| table.index(c))
            .collect::<SessionResult<Vec<_>>>()?;
        let mut groups: BTreeMap<Key, Vec<&Vec<Value>>> = BTreeMap::new();
        for (_, row) in matching {
            let group_key = group_columns.iter().map(|&i| row[i].clone()).collect();
            groups.entry(group_key).or_default().push(row);
        }

        groups
            .values()
            .map(|rows| {
                query
                    .select
                    .iter()
                    .map(|expr| eval(table, expr, rows, &query.group_by))
                    .collect::<SessionResult<Vec<_>>>()
                    .map(Row)
            })
            .collect()
    }
}

/// Evaluates `expr` over a group of rows. Non-grouped queries pass one row.
fn eval(
    table: &Table,
    expr: &Expr,
    rows: &[&Vec<Value>],
    group_by: &[&'static str],
) -> SessionResult<Value> {
    let first = || {
        rows.first()
            .ok_or_else(|| SessionError::InvalidArgument("column read from an empty group".into()))
    };
    match expr {
        Expr::Column(column) => {
            if rows.len() > 1 && !group_by.contains(column) {
                return Err(SessionError::InvalidArgument(format!(
                    "column `{column}` is neither grouped nor aggregated"
                )));
            }
            Ok(first()?[table.index(column)?].clone())
        }
        Expr::Length(column) => match &first()?[table.index(column)?] {
            Value::Null => Ok(Value::Int64(0)),
            Value::Bytes(b) => Ok(Value::Int64(b.len() as i64)),
            Value::String(s) => Ok(Value::Int64(s.chars().count() as i64)),
            other => Err(SessionError::InvalidArgument(format!(
                "LENGTH of non string value {other:?}"
            ))),
        },
        Expr::Add(parts) => {
            let mut total = 0i64;
            for part in parts {
                match eval(table, part, rows, group_by)? {
                    Value::Null => return Ok(Value::Null),
                    Value::Int64(v) => {
                        total = total.checked_add(v).ok_or(SessionError::Overflow("ADD"))?;
                    }
                    other => {
                        return Err(SessionError::InvalidArgument(format!("cannot add {other:?}")));
                    }
                }
            }
            Ok(Value::Int64(total))
        }
        Expr::Sum(inner) => {
            let mut total: Option<i64> = None;
            for row in rows {
                match eval(table, inner, std::slice::from_ref(row), group_by)? {
                    Value::Null => {}
                    Value::Int64(v) => {
                        let sum = total.unwrap_or(0).checked_add(v);
                        total = Some(sum.ok_or(SessionError::Overflow("SUM"))?);
                    }
                    other => {
                        return Err(SessionError::InvalidArgument(format!("cannot sum {other:?}")));
                    }
                }
            }
            Ok(total.map_or(Value::Null, Value::Int64))
        }
        Expr::Count => Ok(Value::Int64(rows.len() as i64)),
        Expr::CountIf(column, value) => {
            let i = table.index(column)?;
            Ok(Value::Int64(rows.iter().filter(|row| &row[i] == value).count() as i64))
        }
    }
}

/// Applies the engine's implicit conversions for a value written into `column`.
fn coerce(table: &str, column: &ColumnSchema, value: Value) -> SessionResult<Value> {
    let mismatch = |value: &Value| {
        SessionError::InvalidArgument(format!(
            "value {value:?} does not fit column `{table}.{}` of type {:?}",
            column.name, column.ty
        ))
    };
    match (column.ty, value) {
        (_, Value::Null) if column.nullable => Ok(Value::Null),
        (_, Value::Null) => Err(SessionError::InvalidArgument(format!(
            "column `{table}.{}` is not nullable",
            column.name
        ))),
        (ColumnType::String, Value::Bytes(b)) => Ok(Value::String(STANDARD.encode(b))),
        (ColumnType::Bytes, Value::String(s)) => STANDARD
            .decode(s.as_bytes())
            .map(Value::Bytes)
            .map_err(|_| mismatch(&Value::String(s))),
        (ColumnType::Bool, v @ Value::Bool(_))
        | (ColumnType::Int64, v @ Value::Int64(_))
        | (ColumnType::Timestamp, v @ Value::Timestamp(_))
        | (ColumnType::String, v @ Value::String(_))
        | (ColumnType::Bytes, v @ Value::Bytes(_)) => Ok(v),
        (_, v) => Err(mismatch(&v)),
    }
}

/// Pending changes of one mutation group, checked against committed state.
struct Staged {
    writes: BTreeMap<(&'static str, Key), Option<Vec<Value>>>,
    cleared: HashSet<&'static str>,
    sequences: HashMap<&'static str, i64>,
}

impl Staged {
    fn current<'a>(
        &'a self,
        state: &'a State,
        table: &Table,
        key: &Key,
        at: DateTime<Utc>,
    ) -> Option<&'a Vec<Value>> {
        let name = table.schema.name;
        if let Some(staged) = self.writes.get(&(name, key.clone())) {
            return staged.as_ref();
        }
        if self.cleared.contains(name) {
            return None;
        }
        state.tables.get(name).and_then(|t| t.visible_at(key, at))
    }

    fn next_sequence(&mut self, state: &State, name: &'static str) -> i64 {
        let value = self
            .sequences
            .entry(name)
            .or_insert_with(|| state.sequences.get(name).copied().unwrap_or(0));
        *value += 1;
        *value
    }

    fn write(
        &mut self,
        state: &State,
        write: Write,
        kind: WriteKind,
        at: DateTime<Utc>,
    ) -> SessionResult<()> {
        let table = state.table(write.table)?;
        if write.columns.len() != write.values.len() {
            return Err(SessionError::InvalidArgument(format!(
                "{} columns but {} values for table `{}`",
                write.columns.len(),
                write.values.len(),
                write.table
            )));
        }

        let mut given: Vec<Option<Value>> = vec![None; table.schema.columns.len()];
        for (column, value) in write.columns.iter().zip(write.values) {
            let i = table.index(column)?;
            given[i] = Some(coerce(write.table, &table.schema.columns[i], value)?);
        }
        for &i in &table.key_columns {
            if given[i].is_none() {
                return Err(SessionError::InvalidArgument(format!(
                    "key column `{}` missing",
                    table.schema.columns[i].name
                )));
            }
        }
        let key: Key = table
            .key_columns
            .iter()
            .map(|&i| given[i].clone().unwrap_or(Value::Null))
            .collect();

        let existing = self.current(state, table, &key, at).cloned();
        let row = match (kind, existing) {
            (WriteKind::Insert, Some(_)) => {
                return Err(SessionError::AlreadyExists {
                    table: write.table.to_string(),
                });
            }
            (WriteKind::InsertOrIgnore, Some(_)) => return Ok(()),
            (WriteKind::InsertOrUpdate, Some(mut row)) => {
                for (i, value) in given.into_iter().enumerate() {
                    if let Some(value) = value {
                        row[i] = value;
                    }
                }
                row
            }
            (_, None) => {
                let mut row = Vec::with_capacity(given.len());
                for (column, value) in table.schema.columns.iter().zip(given) {
                    let value = match (value, column.default_sequence) {
                        (Some(v), _) => v,
                        (None, Some(sequence)) => Value::Int64(self.next_sequence(state, sequence)),
                        (None, None) => coerce(write.table, column, Value::Null)?,
                    };
                    row.push(value);
                }
                row
            }
        };
        self.writes.insert((write.table, key), Some(row));
        Ok(())
    }

    fn delete_all(&mut self, state: &State, name: &'static str) -> SessionResult<()> {
        state.table(name)?;
        self.writes.retain(|(table, _), _| *table != name);
        self.cleared.insert(name);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum WriteKind {
    Insert,
    InsertOrUpdate,
    InsertOrIgnore,
}

fn rows_stream(rows: Vec<Row>) -> RowStream {
    futures::stream::iter(rows.into_iter().map(Ok)).boxed()
}

#[async_trait]
impl DistributedSession for Emulator {
    async fn update_ddl(&self, tables: Vec<TableSchema>) -> SessionResult<()> {
        let mut state = self.state.lock();
        for schema in tables {
            if state.tables.contains_key(schema.name) {
                continue;
            }
            for column in &schema.columns {
                if let Some(sequence) = column.default_sequence {
                    state.sequences.entry(sequence).or_insert(0);
                }
            }
            debug!(table = schema.name, "emulator: create table");
            state.tables.insert(schema.name, Table::new(schema)?);
        }
        Ok(())
    }

    async fn query(&self, query: Query, bound: TimestampBound) -> SessionResult<RowStream> {
        tokio::task::yield_now().await;
        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock();
        let at = state.resolve(bound)?;
        Self::run(&state, &query, at, None).map(rows_stream)
    }

    async fn partition_query(
        &self,
        query: Query,
        bound: TimestampBound,
    ) -> SessionResult<Vec<Partition>> {
        tokio::task::yield_now().await;
        self.counters
            .partition_queries
            .fetch_add(1, Ordering::Relaxed);
        if !query.is_partitionable() {
            return Err(SessionError::InvalidArgument("query is not root partitionable".into()));
        }
        if let TimestampBound::MaxStaleness(_) = bound {
            return Err(SessionError::InvalidArgument(
                "partitioned reads need a strong or exact timestamp bound".into(),
            ));
        }

        let state = self.state.lock();
        let at = state.resolve(bound)?;
        let table = state.table(query.table)?;
        let keys: Vec<&Key> = table
            .scan_at(at)
            .map(|(key, _)| key)
            .filter(|key| query.range.as_ref().is_none_or(|r| r.contains(key)))
            .collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let per_partition = keys.len().div_ceil(self.max_partitions);
        Ok(keys
            .chunks(per_partition)
            .map(|chunk| Partition {
                query: query.clone(),
                read_timestamp: at,
                keys: KeyRange {
                    start: chunk[0].clone(),
                    end: chunk[chunk.len() - 1].clone(),
                },
            })
            .collect())
    }

    async fn execute_partition(&self, partition: Partition) -> SessionResult<RowStream> {
        tokio::task::yield_now().await;
        self.counters
            .partition_executions
            .fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock();
        Self::run(
            &state,
            &partition.query,
            partition.read_timestamp,
            Some(&partition.keys),
        )
        .map(rows_stream)
    }

    async fn apply(&self, mutations: Vec<Mutation>) -> SessionResult<DateTime<Utc>> {
        tokio::task::yield_now().await;
        self.counters.applies.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        let commit = state.next_commit_timestamp();
        let visible = state.latest();

        let mut staged = Staged {
            writes: BTreeMap::new(),
            cleared: HashSet::new(),
            sequences: HashMap::new(),
        };
        for mutation in mutations {
            match mutation {
                Mutation::Insert(w) => staged.write(&state, w, WriteKind::Insert, visible)?,
                Mutation::InsertOrUpdate(w) => {
                    staged.write(&state, w, WriteKind::InsertOrUpdate, visible)?
                }
                Mutation::InsertOrIgnore(w) => {
                    staged.write(&state, w, WriteKind::InsertOrIgnore, visible)?
                }
                Mutation::DeleteAll { table } => staged.delete_all(&state, table)?,
            }
        }

        for name in &staged.cleared {
            if let Some(table) = state.tables.get_mut(name) {
                for versions in table.rows.values_mut() {
                    if version_at(versions, visible).is_some() {
                        versions.push(Version {
                            committed_at: commit,
                            row: None,
                        });
                    }
                }
            }
        }
        for ((name, key), row) in staged.writes {
            if let Some(table) = state.tables.get_mut(name) {
                let versions = table.rows.entry(key).or_default();
                // a cleared key rewritten in the same group keeps only the new version
                if versions.last().is_some_and(|v| v.committed_at == commit) {
                    versions.pop();
                }
                versions.push(Version {
                    committed_at: commit,
                    row,
                });
            }
        }
        state.sequences.extend(staged.sequences);
        state.last_commit = Some(commit);
        Ok(commit)
    }
}
