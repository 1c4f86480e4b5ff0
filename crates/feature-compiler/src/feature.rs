use std::fmt;

use serde::{Deserialize, Serialize};

/// One derived column, as submitted by a user or an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSpec {
    /// Output column name.
    pub name: String,
    pub transform: TransformKind,
    /// Primary input column.
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_column: Option<String>,
    #[serde(default)]
    pub params: FeatureParams,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl FeatureSpec {
    pub fn new(
        name: impl Into<String>,
        transform: TransformKind,
        column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            transform,
            column: column.into(),
            secondary_column: None,
            target_column: None,
            params: FeatureParams::default(),
            enabled: true,
        }
    }

    pub fn with_secondary(mut self, column: impl Into<String>) -> Self {
        self.secondary_column = Some(column.into());
        self
    }

    pub fn with_target(mut self, column: impl Into<String>) -> Self {
        self.target_column = Some(column.into());
        self
    }

    pub fn with_params(mut self, params: FeatureParams) -> Self {
        self.params = params;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    Log,
    Sqrt,
    Square,
    Standardize,
    MinMax,
    Bin,
    OneHot,
    FillNa,
    Ratio,
    Difference,
    Product,
    DatePart,
    TargetEncode,
}

impl TransformKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Sqrt => "sqrt",
            Self::Square => "square",
            Self::Standardize => "standardize",
            Self::MinMax => "min_max",
            Self::Bin => "bin",
            Self::OneHot => "one_hot",
            Self::FillNa => "fill_na",
            Self::Ratio => "ratio",
            Self::Difference => "difference",
            Self::Product => "product",
            Self::DatePart => "date_part",
            Self::TargetEncode => "target_encode",
        }
    }

    /// Binary transforms read `secondary_column` as their right operand.
    pub fn needs_secondary(self) -> bool {
        matches!(self, Self::Ratio | Self::Difference | Self::Product)
    }

    pub fn needs_target(self) -> bool {
        matches!(self, Self::TargetEncode)
    }
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transform-specific knobs. Each transform reads only the fields it uses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureParams {
    /// `bin`: number of equal-width bins (at least 2, default 5).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bins: Option<u32>,
    /// `fill_na`: how to compute the fill value (default `mean`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<FillStrategy>,
    /// `fill_na` with `strategy: value`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_value: Option<serde_json::Value>,
    /// `date_part`: component to extract.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part: Option<DatePart>,
    /// `target_encode`: weight of the global mean (default 0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smoothing: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStrategy {
    Mean,
    Median,
    Mode,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatePart {
    Year,
    Month,
    Day,
    Weekday,
    Hour,
}

impl DatePart {
    /// pandas `.dt` accessor attribute.
    pub fn accessor(self) -> &'static str {
        match self {
            Self::Year => "year",
            Self::Month => "month",
            Self::Day => "day",
            Self::Weekday => "weekday",
            Self::Hour => "hour",
        }
    }
}
