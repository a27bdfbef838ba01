//! Data access layer
//!
//! - `postgres` - connections, the catalog reader and the destination target
//! - `traits` - `CatalogSource` and `ApplyTarget` seams
//! - `types` - catalog rows shared by every implementation
//! - `error` - `DataError` and `TargetError`

pub mod error;
pub mod postgres;
pub mod traits;
pub mod types;

pub use error::{DataError, TargetError};
pub use traits::{ApplyTarget, CatalogSource};
pub use types::{DatabaseAclRow, DatabaseRow, RoleRow};
