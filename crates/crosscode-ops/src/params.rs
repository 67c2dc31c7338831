use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OperationError;
use crate::registry::{self, Operation};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallSdkParams {
    /// `Xcode.xip` archive, or an extracted `Xcode.app` when `is_dir` is set.
    pub xcode_path: String,
    pub toolchain_path: String,
    #[serde(default)]
    pub is_dir: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub id: u32,
    pub uuid: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployParams {
    pub project_path: String,
    pub toolchain_path: String,
    pub device: DeviceInfo,
    #[serde(default)]
    pub debug: bool,
}

/// Parameters for one registered operation, tagged by operation id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum OperationParams {
    InstallSdk(InstallSdkParams),
    Deploy(DeployParams),
}

impl OperationParams {
    pub fn operation(&self) -> &'static Operation {
        match self {
            OperationParams::InstallSdk(_) => &registry::INSTALL_SDK,
            OperationParams::Deploy(_) => &registry::DEPLOY,
        }
    }

    pub fn validate(&self) -> Result<(), OperationError> {
        let operation = self.operation().id;
        match self {
            OperationParams::InstallSdk(p) => {
                require(operation, "xcodePath", &p.xcode_path)?;
                require(operation, "toolchainPath", &p.toolchain_path)
            }
            OperationParams::Deploy(p) => {
                require(operation, "projectPath", &p.project_path)?;
                require(operation, "toolchainPath", &p.toolchain_path)?;
                require(operation, "device.uuid", &p.device.uuid)
            }
        }
    }

    /// The parameter object the backend entry point receives (no tag).
    pub fn to_payload(&self) -> Result<Value, OperationError> {
        let encoded = match self {
            OperationParams::InstallSdk(p) => serde_json::to_value(p),
            OperationParams::Deploy(p) => serde_json::to_value(p),
        };
        encoded.map_err(|err| OperationError::Encode {
            operation: self.operation().id,
            message: err.to_string(),
        })
    }
}

impl From<InstallSdkParams> for OperationParams {
    fn from(params: InstallSdkParams) -> Self {
        OperationParams::InstallSdk(params)
    }
}

impl From<DeployParams> for OperationParams {
    fn from(params: DeployParams) -> Self {
        OperationParams::Deploy(params)
    }
}

fn require(operation: &'static str, field: &str, value: &str) -> Result<(), OperationError> {
    if value.trim().is_empty() {
        return Err(OperationError::InvalidParams {
            operation,
            reason: format!("{field} is required"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_is_camel_case_without_tag() {
        let params = OperationParams::from(InstallSdkParams {
            xcode_path: "/tmp/Xcode.xip".into(),
            toolchain_path: "/opt/swift".into(),
            is_dir: false,
        });
        assert_eq!(params.operation().id, "install_sdk");
        assert_eq!(
            params.to_payload().unwrap(),
            json!({"xcodePath": "/tmp/Xcode.xip", "toolchainPath": "/opt/swift", "isDir": false})
        );
    }

    #[test]
    fn tagged_form_selects_operation() {
        let params: OperationParams = serde_json::from_value(json!({
            "operation": "deploy",
            "projectPath": "/src/app",
            "toolchainPath": "/opt/swift",
            "device": {"name": "iPhone", "id": 1, "uuid": "00008110"}
        }))
        .unwrap();
        assert_eq!(params.operation().id, "deploy");
        params.validate().unwrap();
    }

    #[test]
    fn blank_fields_are_rejected() {
        let params = OperationParams::from(DeployParams {
            project_path: "/src/app".into(),
            toolchain_path: "/opt/swift".into(),
            device: DeviceInfo::default(),
            debug: false,
        });
        let err = params.validate().unwrap_err();
        assert!(matches!(
            err,
            OperationError::InvalidParams { operation: "deploy", ref reason } if reason.contains("device.uuid")
        ));

        let params = OperationParams::from(InstallSdkParams {
            xcode_path: "  ".into(),
            toolchain_path: "/opt/swift".into(),
            is_dir: true,
        });
        assert!(params.validate().is_err());
    }

    #[test]
    fn empty_toolchain_is_rejected_before_dispatch() {
        let params = OperationParams::from(InstallSdkParams {
            xcode_path: "/tmp/Xcode.xip".into(),
            toolchain_path: String::new(),
            is_dir: false,
        });
        let err = params.validate().unwrap_err();
        assert!(matches!(
            err,
            OperationError::InvalidParams { operation: "install_sdk", ref reason } if reason.contains("toolchainPath")
        ));
    }
}
