//! Query and single-table mutation documents.
//!
//! Every builder produces one line of GraphQL text. Destructive writes
//! always require a non-empty filter; that rule is enforced here, before
//! anything reaches the network.

use crate::error::{DocumentError, DocumentResult};
use crate::filter::{Filter, OnConflict, OrderBy};
use crate::selection::{Aggregate, Returning, Selection};
use crate::value::Value;

/// Arguments of a table read.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryArgs {
    pub select: Selection,
    pub filter: Option<Filter>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub order_by: Vec<OrderBy>,
    pub aggregate: Option<Aggregate>,
}

impl QueryArgs {
    pub fn new(select: impl Into<Selection>) -> Self {
        Self {
            select: select.into(),
            ..Default::default()
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn aggregate(mut self, aggregate: Aggregate) -> Self {
        self.aggregate = Some(aggregate);
        self
    }

    /// The aggregate block that will be requested; empty aggregates are skipped.
    pub fn requested_aggregate(&self) -> Option<&Aggregate> {
        self.aggregate.as_ref().filter(|a| !a.is_empty())
    }
}

/// Records to insert, with optional upsert behaviour.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InsertArgs {
    pub objects: Vec<Value>,
    pub on_conflict: Option<OnConflict>,
    pub returning: Option<Returning>,
}

impl InsertArgs {
    /// Inserts a single record.
    pub fn one(record: impl Into<Value>) -> Self {
        Self::from_value(record.into())
    }

    /// Inserts several records.
    pub fn many<I, V>(records: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            objects: records.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// A list becomes many records, `null` none, anything else one record.
    pub fn from_value(data: Value) -> Self {
        let objects = match data {
            Value::Null => Vec::new(),
            Value::List(items) => items,
            record => vec![record],
        };
        Self {
            objects,
            ..Default::default()
        }
    }

    pub fn on_conflict(mut self, conflict: OnConflict) -> Self {
        self.on_conflict = Some(conflict);
        self
    }

    pub fn returning(mut self, returning: impl Into<Returning>) -> Self {
        self.returning = Some(returning.into());
        self
    }
}

/// A conditioned `_set` update.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateArgs {
    pub patch: Value,
    pub filter: Filter,
    pub returning: Option<Returning>,
}

impl UpdateArgs {
    pub fn new(patch: impl Into<Value>, filter: Filter) -> Self {
        Self {
            patch: patch.into(),
            filter,
            returning: None,
        }
    }

    pub fn returning(mut self, returning: impl Into<Returning>) -> Self {
        self.returning = Some(returning.into());
        self
    }
}

/// A conditioned delete.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeleteArgs {
    pub filter: Filter,
    pub returning: Option<Returning>,
}

impl DeleteArgs {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            returning: None,
        }
    }

    pub fn returning(mut self, returning: impl Into<Returning>) -> Self {
        self.returning = Some(returning.into());
        self
    }
}

/// One entry of a bulk update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateManyEntry {
    pub patch: Value,
    pub filter: Filter,
}

impl UpdateManyEntry {
    pub fn new(patch: impl Into<Value>, filter: Filter) -> Self {
        Self {
            patch: patch.into(),
            filter,
        }
    }
}

/// Builds a read document.
///
/// ```
/// use gqlconnect_core::{query_document, Filter, QueryArgs};
///
/// let args = QueryArgs::new(vec!["id", "name"])
///     .filter(Filter::eq("role", "admin"))
///     .limit(10);
/// assert_eq!(
///     query_document("users", &args),
///     r#"query { users(where: {role: {_eq: "admin"}}, limit: 10) { id name } }"#
/// );
/// ```
pub fn query_document(table: &str, args: &QueryArgs) -> String {
    let mut clauses = Vec::new();
    let filter = args.filter.as_ref().filter(|f| !f.is_empty());
    if let Some(filter) = filter {
        clauses.push(format!("where: {}", filter));
    }
    if let Some(limit) = args.limit {
        clauses.push(format!("limit: {}", limit));
    }
    if let Some(offset) = args.offset {
        clauses.push(format!("offset: {}", offset));
    }
    if !args.order_by.is_empty() {
        clauses.push(format!("order_by: {}", OrderBy::to_value(&args.order_by)));
    }

    let mut output = format!(
        "query {{ {}{} {{ {} }}",
        table,
        argument_group(&clauses),
        args.select
    );

    if let Some(aggregate) = args.requested_aggregate() {
        let where_clause: Vec<String> = filter
            .map(|f| vec![format!("where: {}", f)])
            .unwrap_or_default();
        output.push_str(&format!(
            " {}_aggregate{} {{ {} }}",
            table,
            argument_group(&where_clause),
            aggregate
        ));
    }

    output.push_str(" }");
    output
}

/// Builds an insert document. Single records are sent as a one-element list.
pub fn insert_document(table: &str, args: &InsertArgs) -> DocumentResult<String> {
    Ok(mutation(&insert_field(table, args, None)?))
}

/// Builds an update document.
pub fn update_document(table: &str, args: &UpdateArgs) -> DocumentResult<String> {
    Ok(mutation(&update_field(table, args, None)?))
}

/// Builds a delete document.
pub fn delete_document(table: &str, args: &DeleteArgs) -> DocumentResult<String> {
    Ok(mutation(&delete_field(table, args, None)?))
}

/// Builds one `update_{table}_many` field carrying every entry.
pub fn update_many_document(
    table: &str,
    entries: &[UpdateManyEntry],
    returning: Option<&Returning>,
) -> DocumentResult<String> {
    if entries.is_empty() {
        return Err(DocumentError::EmptyBatch("update_many"));
    }
    let mut updates = Vec::with_capacity(entries.len());
    for entry in entries {
        require_patch(table, &entry.patch)?;
        require_filter("update_many", table, &entry.filter)?;
        updates.push(Value::object([
            ("where", entry.filter.clone().into_value()),
            ("_set", entry.patch.clone()),
        ]));
    }
    Ok(mutation(&format!(
        "update_{}_many(updates: {}) {}",
        table,
        Value::List(updates),
        mutation_selection(returning)
    )))
}

pub(crate) fn insert_field(
    table: &str,
    args: &InsertArgs,
    alias: Option<&str>,
) -> DocumentResult<String> {
    if args.objects.is_empty() || args.objects.iter().all(Value::is_empty) {
        return Err(DocumentError::EmptyData {
            table: table.to_string(),
        });
    }
    let mut clauses = vec![format!("objects: {}", Value::List(args.objects.clone()))];
    if let Some(conflict) = &args.on_conflict {
        clauses.push(format!("on_conflict: {}", conflict.to_value()));
    }
    Ok(field(
        alias,
        &format!("insert_{}", table),
        &clauses,
        args.returning.as_ref(),
    ))
}

pub(crate) fn update_field(
    table: &str,
    args: &UpdateArgs,
    alias: Option<&str>,
) -> DocumentResult<String> {
    require_patch(table, &args.patch)?;
    require_filter("update", table, &args.filter)?;
    let clauses = vec![
        format!("where: {}", args.filter),
        format!("_set: {}", args.patch),
    ];
    Ok(field(
        alias,
        &format!("update_{}", table),
        &clauses,
        args.returning.as_ref(),
    ))
}

pub(crate) fn delete_field(
    table: &str,
    args: &DeleteArgs,
    alias: Option<&str>,
) -> DocumentResult<String> {
    require_filter("delete", table, &args.filter)?;
    let clauses = vec![format!("where: {}", args.filter)];
    Ok(field(
        alias,
        &format!("delete_{}", table),
        &clauses,
        args.returning.as_ref(),
    ))
}

pub(crate) fn mutation(body: &str) -> String {
    format!("mutation {{ {} }}", body)
}

fn field(alias: Option<&str>, name: &str, clauses: &[String], returning: Option<&Returning>) -> String {
    let prefix = alias.map(|a| format!("{}: ", a)).unwrap_or_default();
    format!(
        "{}{}{} {}",
        prefix,
        name,
        argument_group(clauses),
        mutation_selection(returning)
    )
}

fn mutation_selection(returning: Option<&Returning>) -> String {
    match returning.filter(|r| !r.is_empty()) {
        Some(returning) => format!("{{ affected_rows returning {{ {} }} }}", returning),
        None => "{ affected_rows }".to_string(),
    }
}

fn argument_group(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!("({})", clauses.join(", "))
    }
}

fn require_filter(operation: &'static str, table: &str, filter: &Filter) -> DocumentResult<()> {
    if filter.is_empty() {
        return Err(DocumentError::MissingFilter {
            operation,
            table: table.to_string(),
        });
    }
    Ok(())
}

fn require_patch(table: &str, patch: &Value) -> DocumentResult<()> {
    match patch {
        Value::Object(fields) if !fields.is_empty() => Ok(()),
        _ => Err(DocumentError::EmptyPatch {
            table: table.to_string(),
        }),
    }
}
