//! Persistence layer — sqlx row types and per-table stores.
//!
//! Stores are free functions over `&PgPool`; every read and write takes an
//! `org_id` (directly or through a row that carries one) so cross-tenant
//! access cannot be expressed. Queries use the runtime `query_as` API, not
//! the compile-time macros, so builds do not require a live database.

pub mod audit;
pub mod keys;
pub mod models;
pub mod org_config;
pub mod orgs;
pub mod policies;
pub mod providers;
pub mod requests;
