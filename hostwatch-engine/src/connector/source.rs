use super::compute::Compute;
use crate::macros;
use serde::{Deserialize, Deserializer, Serialize};

/// One declarative data fetch. The protocol part is a sum type, the rest is
/// common to every protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(flatten)]
    pub definition: SourceDefinition,
    #[serde(default)]
    pub force_serialization: bool,
    #[serde(default)]
    pub computes: Vec<Compute>,
}

/// Variant tag of a [`SourceDefinition`], used by the extension registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceType {
    SnmpGet,
    SnmpTable,
    Wmi,
    Wbem,
    Http,
    CommandLine,
    Ipmi,
    Sql,
    SshInteractive,
    TableJoin,
    TableUnion,
    Copy,
    Static,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SourceDefinition {
    SnmpGet(SnmpGetSource),
    SnmpTable(SnmpTableSource),
    Wmi(WqlSource),
    Wbem(WqlSource),
    Http(HttpSource),
    CommandLine(CommandLineSource),
    Ipmi(IpmiSource),
    Sql(SqlSource),
    SshInteractive(SshInteractiveSource),
    TableJoin(TableJoinSource),
    TableUnion(TableUnionSource),
    Copy(CopySource),
    Static(StaticSource),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnmpGetSource {
    pub oid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnmpTableSource {
    pub oid: String,
    #[serde(default, deserialize_with = "comma_list")]
    pub select_columns: Vec<String>,
}

/// WMI and WBEM share the same shape: a WQL query in a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WqlSource {
    pub query: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpSource {
    #[serde(default = "default_http_method")]
    pub method: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub result_content: Option<String>,
}

fn default_http_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandLineSource {
    pub command_line: String,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub execute_locally: bool,
    #[serde(default)]
    pub begin_at_line_number: Option<usize>,
    #[serde(default)]
    pub end_at_line_number: Option<usize>,
    #[serde(default)]
    pub separators: Option<String>,
    #[serde(default, deserialize_with = "comma_list")]
    pub select_columns: Vec<String>,
    #[serde(default)]
    pub keep_only_regexp: Option<String>,
    #[serde(default)]
    pub exclude_regexp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IpmiSource {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlSource {
    pub query: String,
    #[serde(default)]
    pub database: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshInteractiveSource {
    #[serde(default)]
    pub port: Option<u16>,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableJoinSource {
    pub left_table: String,
    pub right_table: String,
    pub left_key_column: usize,
    pub right_key_column: usize,
    #[serde(default)]
    pub default_right_line: Option<String>,
    #[serde(default)]
    pub key_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableUnionSource {
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopySource {
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticSource {
    pub value: String,
}

impl Source {
    pub fn new(definition: SourceDefinition) -> Self {
        Self { definition, force_serialization: false, computes: Vec::new() }
    }

    pub fn source_type(&self) -> SourceType {
        self.definition.source_type()
    }

    /// Raw `${source::...}` references this source reads, in declaration order.
    pub fn references(&self) -> Vec<String> {
        let mut references = Vec::new();
        match &self.definition {
            SourceDefinition::TableJoin(join) => {
                references.push(join.left_table.clone());
                references.push(join.right_table.clone());
            }
            SourceDefinition::TableUnion(union) => references.extend(union.tables.iter().cloned()),
            SourceDefinition::Copy(copy) => references.push(copy.from.clone()),
            SourceDefinition::Static(value) => references.push(value.value.clone()),
            definition => {
                for text in definition.text_fields() {
                    references.extend(macros::find_source_references(text));
                }
            }
        }
        for compute in &self.computes {
            for text in compute.text_fields() {
                references.extend(macros::find_source_references(text));
            }
        }
        references.retain(|r| macros::is_source_reference(r));
        references
    }
}

impl SourceDefinition {
    pub fn source_type(&self) -> SourceType {
        match self {
            SourceDefinition::SnmpGet(_) => SourceType::SnmpGet,
            SourceDefinition::SnmpTable(_) => SourceType::SnmpTable,
            SourceDefinition::Wmi(_) => SourceType::Wmi,
            SourceDefinition::Wbem(_) => SourceType::Wbem,
            SourceDefinition::Http(_) => SourceType::Http,
            SourceDefinition::CommandLine(_) => SourceType::CommandLine,
            SourceDefinition::Ipmi(_) => SourceType::Ipmi,
            SourceDefinition::Sql(_) => SourceType::Sql,
            SourceDefinition::SshInteractive(_) => SourceType::SshInteractive,
            SourceDefinition::TableJoin(_) => SourceType::TableJoin,
            SourceDefinition::TableUnion(_) => SourceType::TableUnion,
            SourceDefinition::Copy(_) => SourceType::Copy,
            SourceDefinition::Static(_) => SourceType::Static,
        }
    }

    /// Sources computed by the engine from already registered tables.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            SourceDefinition::TableJoin(_)
                | SourceDefinition::TableUnion(_)
                | SourceDefinition::Copy(_)
                | SourceDefinition::Static(_)
        )
    }

    pub fn text_fields(&self) -> Vec<&String> {
        match self {
            SourceDefinition::SnmpGet(s) => vec![&s.oid],
            SourceDefinition::SnmpTable(s) => vec![&s.oid],
            SourceDefinition::Wmi(s) | SourceDefinition::Wbem(s) => {
                let mut fields = vec![&s.query];
                fields.extend(s.namespace.as_ref());
                fields
            }
            SourceDefinition::Http(s) => {
                [&s.url, &s.path, &s.header, &s.body].into_iter().flatten().collect()
            }
            SourceDefinition::CommandLine(s) => vec![&s.command_line],
            SourceDefinition::Ipmi(_) => Vec::new(),
            SourceDefinition::Sql(s) => vec![&s.query],
            SourceDefinition::SshInteractive(s) => s.steps.iter().collect(),
            SourceDefinition::TableJoin(s) => vec![&s.left_table, &s.right_table],
            SourceDefinition::TableUnion(s) => s.tables.iter().collect(),
            SourceDefinition::Copy(s) => vec![&s.from],
            SourceDefinition::Static(s) => vec![&s.value],
        }
    }

    pub fn text_fields_mut(&mut self) -> Vec<&mut String> {
        match self {
            SourceDefinition::SnmpGet(s) => vec![&mut s.oid],
            SourceDefinition::SnmpTable(s) => vec![&mut s.oid],
            SourceDefinition::Wmi(s) | SourceDefinition::Wbem(s) => {
                let mut fields = vec![&mut s.query];
                fields.extend(s.namespace.as_mut());
                fields
            }
            SourceDefinition::Http(s) => {
                [&mut s.url, &mut s.path, &mut s.header, &mut s.body].into_iter().flatten().collect()
            }
            SourceDefinition::CommandLine(s) => vec![&mut s.command_line],
            SourceDefinition::Ipmi(_) => Vec::new(),
            SourceDefinition::Sql(s) => vec![&mut s.query],
            SourceDefinition::SshInteractive(s) => s.steps.iter_mut().collect(),
            SourceDefinition::TableJoin(s) => vec![&mut s.left_table, &mut s.right_table],
            SourceDefinition::TableUnion(s) => s.tables.iter_mut().collect(),
            SourceDefinition::Copy(s) => vec![&mut s.from],
            SourceDefinition::Static(s) => vec![&mut s.value],
        }
    }
}

/// Accepts either `"ID,9,11"` or a YAML sequence.
pub(crate) fn comma_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum CommaList {
        Text(String),
        List(Vec<serde_yaml::Value>),
    }

    Ok(match CommaList::deserialize(deserializer)? {
        CommaList::Text(text) => text
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        CommaList::List(values) => values
            .into_iter()
            .map(|v| match v {
                serde_yaml::Value::String(s) => s,
                other => serde_yaml::to_string(&other).unwrap_or_default().trim().to_string(),
            })
            .collect(),
    })
}
