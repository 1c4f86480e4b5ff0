//! Feature compiler: turns an ordered list of declarative feature specs into
//! a Python script that derives the features from a pandas DataFrame.
//!
//! ## Guarantees
//!
//! - **Pure and deterministic**: the same input yields byte-identical output.
//!   Nothing is executed here; the script is handed to a sandbox.
//! - **Order preserving**: one block per enabled feature, in input order.
//!   A later feature may read a column an earlier one created.
//! - **Validated up front**: missing secondary/target columns, bad params and
//!   (when a schema is supplied) unknown columns fail compilation instead of
//!   failing inside the sandbox.
//!
//! ## Generated block
//!
//! ```text
//! # [2] income_per_member: ratio(income, members)
//! _f2_income_per_member_den = df["members"].replace(0, np.nan)
//! df["income_per_member"] = df["income"] / _f2_income_per_member_den
//! del _f2_income_per_member_den
//! ```
//!
//! Temporaries are prefixed `_f<index>_<name>` and deleted at the end of
//! their block, so blocks never see each other's helpers.

mod codegen;
mod error;
mod feature;
mod pipeline;
mod script;

pub use codegen::{compile, compile_with_schema, validate};
pub use error::{CompileError, Result};
pub use feature::{DatePart, FeatureParams, FeatureSpec, FillStrategy, TransformKind};
pub use pipeline::{DatasetFormat, FEATURE_METADATA_KIND, PipelineIo, compile_pipeline};
pub use script::Script;
