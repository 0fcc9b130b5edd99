//! # cohort-extraction
//!
//! Releases datasets for a committed cohort with private identifiers
//! replaced by release identifiers.
//!
//! ## Features
//!
//! - **`cross-server`** (default): copy the cohort onto the dataset's server
//!   when the two live apart, serialized through a process-wide gate
//!
//! ## Quick Start
//!
//! ### Same server
//!
//! ```ignore
//! use cohort_extraction::{DatasetExtractionSource, ExtractionRequest, ExtractionSource};
//!
//! let mut source = DatasetExtractionSource::new(request, resolver);
//! while let Some(chunk) = source.get_chunk().await? {
//!     write(chunk.data)?;
//! }
//! source.dispose().await?;
//! ```
//!
//! ### Building the query only
//!
//! ```rust
//! use cohort_extraction::{
//!     ExtractableCohort, ExtractableColumn, ExtractableDataset, ExtractionConfiguration,
//!     ExtractionQueryBuilder, ExtractionRequest,
//! };
//! use cohort_query::{DataAccessPoint, DatabaseType};
//!
//! let point = DataAccessPoint::new("live01", "biochem", DatabaseType::MicrosoftSqlServer);
//! let dataset = ExtractableDataset::new("biochemistry", point.clone(), "tests")
//!     .with_column(ExtractableColumn::new("[biochem]..[tests].[chi]").identifier());
//! let cohort = ExtractableCohort::new(12, point.clone(), "Cohort");
//! let request = ExtractionRequest::new(ExtractionConfiguration::new(1, 4021).with_cohort(cohort), dataset);
//!
//! let query = ExtractionQueryBuilder::new().build(&request).unwrap();
//! assert!(query.sql.contains("[biochem]..[Cohort].[ReleaseID] AS chi"));
//! ```
//!
//! ### Cross server (feature: `cross-server`)
//!
//! ```ignore
//! use cohort_extraction::cross_server::{CrossServerExtractionSource, CrossServerGate};
//!
//! // one gate for the whole process
//! let gate = CrossServerGate::new();
//!
//! let mut source = CrossServerExtractionSource::new(request, resolver, gate.clone());
//! let chunk = source.get_chunk().await?;
//! source.dispose().await?;
//! ```

pub mod builder;
pub mod config;
pub mod error;
pub mod linkage;
pub mod model;
pub mod source;

// Feature-gated modules
#[cfg(feature = "cross-server")]
pub mod cross_server;

// Re-export commonly used types
pub use builder::{ExtractionQuery, ExtractionQueryBuilder};
pub use config::{CrossServerConfig, CrossServerConfigBuilder, HashingConfig};
pub use error::{ExtractionError, ExtractionResult};
pub use linkage::{ExtractionLinkage, ReleaseIdentifierSubstitution};
pub use model::{
    DatasetFilter, ExtractableCohort, ExtractableColumn, ExtractableDataset, ExtractionConfiguration,
    ExtractionRequest,
};
pub use source::{DatasetExtractionSource, ExtractionChunk, ExtractionSource};

#[cfg(feature = "cross-server")]
pub use cross_server::{
    rewrite_cohort_references, select_extraction_source, CrossServerCopyState, CrossServerExtractionSource,
    CrossServerGate,
};
