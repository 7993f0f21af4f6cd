use super::source::comma_list;
use crate::collections::OrderedMap;
use serde::{Deserialize, Serialize};

/// Post-processing step applied to a source table. Columns are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Compute {
    Add(ArithmeticCompute),
    Subtract(ArithmeticCompute),
    Multiply(ArithmeticCompute),
    Divide(ArithmeticCompute),
    And(ArithmeticCompute),
    Append(ConcatCompute),
    Prepend(ConcatCompute),
    DuplicateColumn(ColumnCompute),
    KeepColumns(KeepColumnsCompute),
    KeepOnlyMatchingLines(MatchingLinesCompute),
    ExcludeMatchingLines(MatchingLinesCompute),
    Replace(ReplaceCompute),
    Translate(TranslateCompute),
    Substring(SubstringCompute),
    Extract(ExtractCompute),
}

/// `value` is a literal number or a `$n` column reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArithmeticCompute {
    pub column: usize,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcatCompute {
    pub column: usize,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnCompute {
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeepColumnsCompute {
    #[serde(deserialize_with = "comma_list")]
    pub column_numbers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingLinesCompute {
    pub column: usize,
    #[serde(default)]
    pub regexp: Option<String>,
    #[serde(default, deserialize_with = "comma_list")]
    pub value_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceCompute {
    pub column: usize,
    pub existing_value: String,
    pub new_value: String,
}

/// Unmatched values use the `default` entry when present, else stay as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateCompute {
    pub column: usize,
    pub translation_table: OrderedMap<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstringCompute {
    pub column: usize,
    pub start: String,
    pub length: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractCompute {
    pub column: usize,
    pub sub_column: usize,
    pub sub_separators: String,
}

impl Compute {
    pub fn name(&self) -> &'static str {
        match self {
            Compute::Add(_) => "add",
            Compute::Subtract(_) => "subtract",
            Compute::Multiply(_) => "multiply",
            Compute::Divide(_) => "divide",
            Compute::And(_) => "and",
            Compute::Append(_) => "append",
            Compute::Prepend(_) => "prepend",
            Compute::DuplicateColumn(_) => "duplicateColumn",
            Compute::KeepColumns(_) => "keepColumns",
            Compute::KeepOnlyMatchingLines(_) => "keepOnlyMatchingLines",
            Compute::ExcludeMatchingLines(_) => "excludeMatchingLines",
            Compute::Replace(_) => "replace",
            Compute::Translate(_) => "translate",
            Compute::Substring(_) => "substring",
            Compute::Extract(_) => "extract",
        }
    }

    /// Free-text operands, scanned for source references.
    pub fn text_fields(&self) -> Vec<&String> {
        match self {
            Compute::Add(c) | Compute::Subtract(c) | Compute::Multiply(c) | Compute::Divide(c) | Compute::And(c) => {
                vec![&c.value]
            }
            Compute::Append(c) | Compute::Prepend(c) => vec![&c.value],
            Compute::KeepOnlyMatchingLines(c) | Compute::ExcludeMatchingLines(c) => {
                c.regexp.iter().chain(c.value_list.iter()).collect()
            }
            Compute::Replace(c) => vec![&c.existing_value, &c.new_value],
            Compute::Translate(c) => c.translation_table.values().collect(),
            Compute::Substring(c) => vec![&c.start, &c.length],
            Compute::DuplicateColumn(_) | Compute::KeepColumns(_) | Compute::Extract(_) => Vec::new(),
        }
    }
}
