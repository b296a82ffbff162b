//! Core document building for gqlconnect.
//!
//! This crate turns structured descriptions of reads and writes into
//! Hasura-flavoured GraphQL documents. It performs no I/O:
//! - `value`: Typed argument values and their printer
//! - `filter`: Where clauses, ordering and upsert conflicts
//! - `selection`: Selection sets, returning specs and aggregates
//! - `document`: Query and single-table mutation documents
//! - `batch`: Multi-operation mutation documents
//! - `error`: Precondition failures

pub mod batch;
pub mod document;
pub mod error;
pub mod filter;
pub mod selection;
pub mod value;

pub use batch::{batch_document, BatchDocument, BatchOperation, BatchOperationKind};
pub use document::{
    delete_document, insert_document, query_document, update_document, update_many_document,
    DeleteArgs, InsertArgs, QueryArgs, UpdateArgs, UpdateManyEntry,
};
pub use error::{DocumentError, DocumentResult};
pub use filter::{Filter, OnConflict, OrderBy, OrderDirection};
pub use selection::{Aggregate, Returning, Selection, SelectionNode};
pub use value::{Object, Value};
