//! Full feature-engineering script: load a dataset, apply the feature blocks,
//! save the result and report column metadata as a structured output.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codegen::{IMPORTS, py_str, render_blocks};
use crate::error::Result;
use crate::feature::FeatureSpec;
use crate::script::Script;

/// Structured output kind carrying `{columns, rowCount, sample}`.
pub const FEATURE_METADATA_KIND: &str = "feature_metadata";

const DEFAULT_SAMPLE_ROWS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetFormat {
    Csv,
    Parquet,
}

impl DatasetFormat {
    /// Guess from the file extension; anything unrecognized is CSV.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("parquet") => Self::Parquet,
            _ => Self::Csv,
        }
    }
}

/// Where the pipeline reads and writes, as paths inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineIo {
    pub input: String,
    pub input_format: DatasetFormat,
    pub output: String,
    pub output_format: DatasetFormat,
    pub sample_rows: usize,
    /// Source columns, when known, enable column validation.
    pub schema: Option<Vec<String>>,
}

impl PipelineIo {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        let input = input.into();
        let output = output.into();
        Self {
            input_format: DatasetFormat::from_path(Path::new(&input)),
            output_format: DatasetFormat::from_path(Path::new(&output)),
            input,
            output,
            sample_rows: DEFAULT_SAMPLE_ROWS,
            schema: None,
        }
    }
}

pub fn compile_pipeline(features: &[FeatureSpec], io: &PipelineIo) -> Result<Script> {
    let schema = io.schema.as_ref().map(|cols| cols.iter().cloned().collect());
    let blocks = render_blocks(features, schema)?;

    let input = py_str(&io.input);
    let output = py_str(&io.output);
    let load = match io.input_format {
        DatasetFormat::Csv => format!("df = pd.read_csv({input})"),
        DatasetFormat::Parquet => format!("df = pd.read_parquet({input})"),
    };
    let save = match io.output_format {
        DatasetFormat::Csv => format!("df.to_csv({output}, index=False)"),
        DatasetFormat::Parquet => format!("df.to_parquet({output}, index=False)"),
    };
    let kind = py_str(FEATURE_METADATA_KIND);
    let rows = io.sample_rows;

    let source = format!(
        "import json\n\
         {IMPORTS}\n\
         {load}\n\
         \n\
         {blocks}\n\
         {save}\n\
         _meta = {{\n    \
             \"columns\": [\n        \
                 {{\"name\": str(c), \"dtype\": str(df[c].dtype), \"nullCount\": int(df[c].isna().sum())}}\n        \
                 for c in df.columns\n    \
             ],\n    \
             \"rowCount\": int(len(df)),\n    \
             \"sample\": json.loads(df.head({rows}).to_json(orient=\"records\", date_format=\"iso\")),\n\
         }}\n\
         print(\"@@output \" + json.dumps({{\"kind\": {kind}, \"data\": _meta}}))\n"
    );
    Ok(Script::new(source))
}
