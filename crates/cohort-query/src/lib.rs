//! # cohort-query
//!
//! Building blocks for compiling cohort-identification queries into
//! dialect-correct SQL.
//!
//! This crate provides:
//! - **Dialect helpers**: identifier quoting, qualification, parameter
//!   declarations and hashing for SQL Server, MySQL and Oracle
//! - **Parameter manager**: collects parameters discovered at each level of a
//!   query tree and resolves same-named declarations by scope
//! - **Configuration model**: plain value types for sub-queries, containers
//!   and the servers they read
//!
//! ## Usage
//!
//! ```rust
//! use cohort_query::{DatabaseType, DeclaredParameter, ParameterManager, ParameterScope};
//!
//! let syntax = DatabaseType::MicrosoftSqlServer.syntax();
//!
//! let mut parameters = ParameterManager::new();
//! parameters.add(DeclaredParameter::declare(
//!     &syntax,
//!     "CohortDefinitionID",
//!     "int",
//!     "12",
//!     "cohort version",
//!     ParameterScope::Global,
//! ));
//!
//! let block = parameters.declaration_block(&syntax);
//! assert_eq!(
//!     block,
//!     "/*cohort version*/\nDECLARE @CohortDefinitionID AS int;\nSET @CohortDefinitionID=12;\n"
//! );
//! ```
//!
//! ## Dialect Quick Reference
//!
//! | Backend | Fully qualified column | Parameters |
//! |---------|------------------------|------------|
//! | SQL Server | `[db]..[table].[col]` | `DECLARE @x AS int;` |
//! | MySQL | `` `db`.`table`.`col` `` | `SET @x=NULL;` |
//! | Oracle | `"DB"."TABLE"."COL"` | not emitted |

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod configuration;
mod dialect;
mod error;
mod parameters;

pub use configuration::{
    AggregateConfiguration, AggregateOperation, CohortContainer, ContainerChild, DataAccessPoint,
    SetOperation,
};
pub use dialect::{DatabaseType, QuerySyntaxHelper};
pub use error::{QueryError, QueryResult};
pub use parameters::{parameter_name, DeclaredParameter, ParameterManager, ParameterScope};
