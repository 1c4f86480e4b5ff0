use std::collections::HashSet;

use crate::error::{CompileError, Result};
use crate::feature::{FeatureSpec, FillStrategy, TransformKind};
use crate::script::Script;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub(crate) const IMPORTS: &str = "import numpy as np\nimport pandas as pd\n";

const DEFAULT_BINS: u32 = 5;

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Compile features into a script that mutates a DataFrame named `df`.
///
/// Column references are not checked against any schema; use
/// [`compile_with_schema`] when the source columns are known.
pub fn compile(features: &[FeatureSpec]) -> Result<Script> {
    let blocks = render_blocks(features, None)?;
    Ok(Script::new(format!("{IMPORTS}\n{blocks}")))
}

/// Like [`compile`], but every column a feature reads must exist in
/// `columns` or be produced by an earlier feature.
pub fn compile_with_schema<I, S>(features: &[FeatureSpec], columns: I) -> Result<Script>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let schema = columns.into_iter().map(Into::into).collect();
    let blocks = render_blocks(features, Some(schema))?;
    Ok(Script::new(format!("{IMPORTS}\n{blocks}")))
}

/// Run every precondition check without emitting code.
pub fn validate(features: &[FeatureSpec]) -> Result<()> {
    check(features, None)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

pub(crate) fn render_blocks(
    features: &[FeatureSpec],
    schema: Option<HashSet<String>>,
) -> Result<String> {
    check(features, schema)?;
    let blocks: Vec<String> = features
        .iter()
        .enumerate()
        .filter(|(_, f)| f.enabled)
        .map(|(index, f)| emit_block(index, f))
        .collect();
    Ok(blocks.join("\n"))
}

/// Disabled features are skipped entirely, so they may be incomplete.
fn check(features: &[FeatureSpec], mut schema: Option<HashSet<String>>) -> Result<()> {
    let mut produced = HashSet::new();

    for (index, feature) in features.iter().enumerate() {
        if !feature.enabled {
            continue;
        }
        if feature.name.trim().is_empty() {
            return Err(CompileError::EmptyName { index });
        }
        if feature.column.trim().is_empty() {
            return Err(CompileError::EmptyColumn {
                feature: feature.name.clone(),
            });
        }

        let secondary = if feature.transform.needs_secondary() {
            Some(non_empty(feature.secondary_column.as_deref()).ok_or_else(|| {
                CompileError::MissingSecondaryColumn {
                    feature: feature.name.clone(),
                    transform: feature.transform,
                }
            })?)
        } else {
            None
        };
        let target = if feature.transform.needs_target() {
            Some(
                non_empty(feature.target_column.as_deref()).ok_or_else(|| {
                    CompileError::MissingTargetColumn {
                        feature: feature.name.clone(),
                    }
                })?,
            )
        } else {
            None
        };

        check_params(feature)?;

        if let Some(columns) = &schema {
            let reads = std::iter::once(feature.column.as_str())
                .chain(secondary)
                .chain(target);
            for column in reads {
                if !columns.contains(column) {
                    return Err(CompileError::UnknownColumn {
                        feature: feature.name.clone(),
                        column: column.to_string(),
                    });
                }
            }
        }

        if !produced.insert(feature.name.as_str()) {
            return Err(CompileError::DuplicateName {
                feature: feature.name.clone(),
            });
        }
        // one_hot produces value-dependent columns that can't be referenced.
        if let Some(columns) = schema.as_mut()
            && feature.transform != TransformKind::OneHot
        {
            columns.insert(feature.name.clone());
        }
    }
    Ok(())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn check_params(feature: &FeatureSpec) -> Result<()> {
    let invalid = |reason: &str| CompileError::InvalidParams {
        feature: feature.name.clone(),
        reason: reason.to_string(),
    };
    let params = &feature.params;
    match feature.transform {
        TransformKind::Bin => {
            if params.bins.unwrap_or(DEFAULT_BINS) < 2 {
                return Err(invalid("bins must be at least 2"));
            }
        }
        TransformKind::FillNa => {
            if params.strategy == Some(FillStrategy::Value) && params.fill_value.is_none() {
                return Err(invalid("strategy 'value' requires fillValue"));
            }
        }
        TransformKind::DatePart => {
            if params.part.is_none() {
                return Err(invalid("date_part requires part"));
            }
        }
        TransformKind::TargetEncode => {
            if let Some(m) = params.smoothing
                && !(m.is_finite() && m >= 0.0)
            {
                return Err(invalid("smoothing must be a non-negative number"));
            }
        }
        TransformKind::Log
        | TransformKind::Sqrt
        | TransformKind::Square
        | TransformKind::Standardize
        | TransformKind::MinMax
        | TransformKind::OneHot
        | TransformKind::Ratio
        | TransformKind::Difference
        | TransformKind::Product => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Emission
// ---------------------------------------------------------------------------

/// Emit one block. Only called after [`check`] passed.
fn emit_block(index: usize, feature: &FeatureSpec) -> String {
    let dst = format!("df[{}]", py_str(&feature.name));
    let src = format!("df[{}]", py_str(&feature.column));
    let col = py_str(&feature.column);
    let secondary = feature
        .secondary_column
        .as_deref()
        .map(|c| format!("df[{}]", py_str(c)))
        .unwrap_or_default();
    let target = feature.target_column.as_deref().map(py_str).unwrap_or_default();
    let tmp = |role: &str| format!("_f{index}_{}_{role}", ident(&feature.name));
    let params = &feature.params;

    let mut lines = vec![header(index, feature)];
    match feature.transform {
        TransformKind::Log => lines.push(format!("{dst} = np.log1p({src}.clip(lower=0))")),
        TransformKind::Sqrt => lines.push(format!("{dst} = np.sqrt({src}.clip(lower=0))")),
        TransformKind::Square => lines.push(format!("{dst} = {src} ** 2")),
        TransformKind::Standardize => {
            let (mean, std) = (tmp("mean"), tmp("std"));
            lines.push(format!("{mean} = {src}.mean()"));
            lines.push(format!("{std} = {src}.std(ddof=0)"));
            lines.push(format!("{dst} = ({src} - {mean}) / ({std} if {std} else 1.0)"));
            lines.push(format!("del {mean}, {std}"));
        }
        TransformKind::MinMax => {
            let (lo, span) = (tmp("lo"), tmp("span"));
            lines.push(format!("{lo} = {src}.min()"));
            lines.push(format!("{span} = {src}.max() - {lo}"));
            lines.push(format!("{dst} = ({src} - {lo}) / ({span} if {span} else 1.0)"));
            lines.push(format!("del {lo}, {span}"));
        }
        TransformKind::Bin => {
            let bins = params.bins.unwrap_or(DEFAULT_BINS);
            lines.push(format!("{dst} = pd.cut({src}, bins={bins}, labels=False)"));
        }
        TransformKind::OneHot => {
            let dummies = tmp("dummies");
            lines.push(format!(
                "{dummies} = pd.get_dummies({src}, prefix={}, dtype=int)",
                py_str(&feature.name)
            ));
            lines.push(format!("df = pd.concat([df, {dummies}], axis=1)"));
            lines.push(format!("del {dummies}"));
        }
        TransformKind::FillNa => match params.strategy.unwrap_or(FillStrategy::Mean) {
            FillStrategy::Mean => lines.push(format!("{dst} = {src}.fillna({src}.mean())")),
            FillStrategy::Median => lines.push(format!("{dst} = {src}.fillna({src}.median())")),
            FillStrategy::Mode => {
                let mode = tmp("mode");
                lines.push(format!("{mode} = {src}.mode()"));
                lines.push(format!(
                    "{dst} = {src}.fillna({mode}.iloc[0] if len({mode}) else None)"
                ));
                lines.push(format!("del {mode}"));
            }
            FillStrategy::Value => {
                let value = params
                    .fill_value
                    .as_ref()
                    .map(py_literal)
                    .unwrap_or_else(|| "None".to_string());
                lines.push(format!("{dst} = {src}.fillna({value})"));
            }
        },
        TransformKind::Ratio => {
            let den = tmp("den");
            lines.push(format!("{den} = {secondary}.replace(0, np.nan)"));
            lines.push(format!("{dst} = {src} / {den}"));
            lines.push(format!("del {den}"));
        }
        TransformKind::Difference => lines.push(format!("{dst} = {src} - {secondary}")),
        TransformKind::Product => lines.push(format!("{dst} = {src} * {secondary}")),
        TransformKind::DatePart => {
            let accessor = params.part.map(|p| p.accessor()).unwrap_or("year");
            lines.push(format!(
                "{dst} = pd.to_datetime({src}, errors=\"coerce\").dt.{accessor}"
            ));
        }
        TransformKind::TargetEncode => {
            let m = params.smoothing.unwrap_or(0.0);
            let (prior, stats, enc) = (tmp("prior"), tmp("stats"), tmp("enc"));
            lines.push(format!("{prior} = df[{target}].mean()"));
            lines.push(format!(
                "{stats} = df.groupby({col})[{target}].agg([\"mean\", \"count\"])"
            ));
            lines.push(format!(
                "{enc} = ({stats}[\"count\"] * {stats}[\"mean\"] + {m} * {prior}) / ({stats}[\"count\"] + {m})"
            ));
            lines.push(format!("{dst} = {src}.map({enc}).fillna({prior})"));
            lines.push(format!("del {prior}, {stats}, {enc}"));
        }
    }

    let mut block = lines.join("\n");
    block.push('\n');
    block
}

fn header(index: usize, feature: &FeatureSpec) -> String {
    let mut args = vec![comment_text(&feature.column)];
    if feature.transform.needs_secondary()
        && let Some(secondary) = &feature.secondary_column
    {
        args.push(comment_text(secondary));
    }
    if feature.transform.needs_target()
        && let Some(target) = &feature.target_column
    {
        args.push(format!("target={}", comment_text(target)));
    }
    format!(
        "# [{index}] {}: {}({})",
        comment_text(&feature.name),
        feature.transform,
        args.join(", ")
    )
}

// ---------------------------------------------------------------------------
// Literals
// ---------------------------------------------------------------------------

/// Double-quoted string literal. JSON escapes are valid Python escapes.
pub(crate) fn py_str(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}

fn py_literal(value: &serde_json::Value) -> String {
    use serde_json::Value;
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => py_str(s),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(py_literal).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(map) => {
            let entries: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", py_str(k), py_literal(v)))
                .collect();
            format!("{{{}}}", entries.join(", "))
        }
    }
}

/// Identifier-safe fragment of a feature name.
fn ident(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn comment_text(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}
