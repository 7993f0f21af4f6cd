use super::DeviceKind;
use serde::{Deserialize, Serialize};

/// One detection test. Parallel to [`super::Source`]: a protocol sum type
/// plus the force-serialization flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Criterion {
    #[serde(flatten)]
    pub definition: CriterionDefinition,
    #[serde(default)]
    pub force_serialization: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CriterionType {
    SnmpGet,
    SnmpGetNext,
    Wmi,
    Wbem,
    Http,
    CommandLine,
    Process,
    Service,
    Ipmi,
    DeviceType,
    ProductRequirements,
    Sql,
    SshInteractive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CriterionDefinition {
    SnmpGet(SnmpCriterion),
    SnmpGetNext(SnmpCriterion),
    Wmi(WqlCriterion),
    Wbem(WqlCriterion),
    Http(HttpCriterion),
    CommandLine(CommandLineCriterion),
    Process(ProcessCriterion),
    Service(ServiceCriterion),
    Ipmi(IpmiCriterion),
    DeviceType(DeviceTypeCriterion),
    ProductRequirements(ProductRequirementsCriterion),
    Sql(SqlCriterion),
    SshInteractive(SshInteractiveCriterion),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnmpCriterion {
    pub oid: String,
    #[serde(default)]
    pub expected_result: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WqlCriterion {
    pub query: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub expected_result: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpCriterion {
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
    pub expected_result: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

fn default_http_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandLineCriterion {
    pub command_line: String,
    #[serde(default)]
    pub expected_result: Option<String>,
    #[serde(default)]
    pub execute_locally: bool,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessCriterion {
    pub command_line: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCriterion {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IpmiCriterion {}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceTypeCriterion {
    #[serde(default)]
    pub keep: Vec<DeviceKind>,
    #[serde(default)]
    pub exclude: Vec<DeviceKind>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRequirementsCriterion {
    #[serde(default)]
    pub engine_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlCriterion {
    pub query: String,
    #[serde(default)]
    pub expected_result: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshInteractiveCriterion {
    pub steps: Vec<String>,
    #[serde(default)]
    pub expected_result: Option<String>,
}

impl Criterion {
    pub fn new(definition: CriterionDefinition) -> Self {
        Self { definition, force_serialization: false }
    }

    pub fn criterion_type(&self) -> CriterionType {
        self.definition.criterion_type()
    }
}

impl CriterionDefinition {
    pub fn criterion_type(&self) -> CriterionType {
        match self {
            CriterionDefinition::SnmpGet(_) => CriterionType::SnmpGet,
            CriterionDefinition::SnmpGetNext(_) => CriterionType::SnmpGetNext,
            CriterionDefinition::Wmi(_) => CriterionType::Wmi,
            CriterionDefinition::Wbem(_) => CriterionType::Wbem,
            CriterionDefinition::Http(_) => CriterionType::Http,
            CriterionDefinition::CommandLine(_) => CriterionType::CommandLine,
            CriterionDefinition::Process(_) => CriterionType::Process,
            CriterionDefinition::Service(_) => CriterionType::Service,
            CriterionDefinition::Ipmi(_) => CriterionType::Ipmi,
            CriterionDefinition::DeviceType(_) => CriterionType::DeviceType,
            CriterionDefinition::ProductRequirements(_) => CriterionType::ProductRequirements,
            CriterionDefinition::Sql(_) => CriterionType::Sql,
            CriterionDefinition::SshInteractive(_) => CriterionType::SshInteractive,
        }
    }

    /// Criteria answered by the engine itself, without any protocol.
    pub fn is_internal(&self) -> bool {
        matches!(self, CriterionDefinition::DeviceType(_) | CriterionDefinition::ProductRequirements(_))
    }
}

/// Outcome of one criterion. Failure is a value, not an error.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CriterionTestResult {
    pub success: bool,
    pub message: Option<String>,
    pub result: Option<String>,
}

impl CriterionTestResult {
    pub fn success(message: impl Into<String>, result: impl Into<String>) -> Self {
        Self { success: true, message: Some(message.into()), result: Some(result.into()) }
    }

    pub fn failure(message: impl Into<String>, result: Option<String>) -> Self {
        Self { success: false, message: Some(message.into()), result }
    }

    /// Failed result carrying neither message nor result.
    pub fn empty() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_tagged_criteria() {
        let criteria: Vec<Criterion> = serde_yaml::from_str(
            r#"
- type: deviceType
  keep: [linux, windows]
- type: snmpGetNext
  oid: 1.3.6.1.4.1.674.10892.1
  forceSerialization: true
- type: commandLine
  commandLine: /usr/bin/ipmitool -V
  expectedResult: "ipmitool version"
"#,
        )
        .unwrap();

        assert_eq!(
            criteria.iter().map(Criterion::criterion_type).collect::<Vec<_>>(),
            vec![CriterionType::DeviceType, CriterionType::SnmpGetNext, CriterionType::CommandLine]
        );
        assert!(criteria[0].definition.is_internal());
        assert!(criteria[1].force_serialization);
        assert!(!criteria[2].force_serialization);
    }
}
