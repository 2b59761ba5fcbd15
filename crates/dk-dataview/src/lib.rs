//! Headless data view: binds a paged CRUD collection to a transaction manager
//! and keeps an optimistic, reversible picture of pending changes in a query
//! cache.

pub mod adapter;
pub mod cache;
pub mod client;
pub mod error;
pub mod filter;
pub mod overlay;
pub mod query;
pub mod render;
pub mod view;

pub use adapter::{DefaultAdapter, ResponseAdapter};
pub use cache::{MemoryCache, QueryCache};
pub use client::{ClientCompensator, CrudClient};
pub use error::{DataViewError, Result};
pub use filter::{FilterField, FilterKind, FilterOption};
pub use overlay::{PendingState, PendingTag};
pub use query::{FilterValue, QueryKey, QueryParams, Sort, SortDirection};
pub use render::{ColumnDescriptor, FilterRenderer, FormRenderer, RowAction, Selection, TableRenderer};
pub use view::{ChangeOutcome, DataView, DataViewBuilder, PageView, RowView};
