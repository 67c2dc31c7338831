//! Multi-step operations the backend knows how to run.
//!
//! Each entry names a backend entry point (`<id>_operation`) and the ordered
//! steps the backend reports progress for.

use serde::Serialize;

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct StepDescriptor {
    pub id: &'static str,
    pub label: &'static str,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct Operation {
    pub id: &'static str,
    pub title: &'static str,
    pub steps: &'static [StepDescriptor],
}

impl Operation {
    pub fn entry_point(&self) -> String {
        format!("{}_operation", self.id)
    }

    pub fn step(&self, step_id: &str) -> Option<&'static StepDescriptor> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    pub fn has_step(&self, step_id: &str) -> bool {
        self.step(step_id).is_some()
    }
}

pub static INSTALL_SDK: Operation = Operation {
    id: "install_sdk",
    title: "Install Darwin SDK",
    steps: &[
        StepDescriptor {
            id: "create_stage",
            label: "Creating stage directory",
        },
        StepDescriptor {
            id: "extract_xip",
            label: "Extracting Xcode",
        },
        StepDescriptor {
            id: "copy_files",
            label: "Copying SDK files",
        },
        StepDescriptor {
            id: "install_sdk",
            label: "Installing SDK",
        },
        StepDescriptor {
            id: "cleanup",
            label: "Cleaning up",
        },
    ],
};

pub static DEPLOY: Operation = Operation {
    id: "deploy",
    title: "Deploy app",
    steps: &[
        StepDescriptor {
            id: "build",
            label: "Building app",
        },
        StepDescriptor {
            id: "sign",
            label: "Signing app",
        },
        StepDescriptor {
            id: "install",
            label: "Installing on device",
        },
        StepDescriptor {
            id: "launch",
            label: "Launching app",
        },
    ],
};

static OPERATIONS: [&Operation; 2] = [&INSTALL_SDK, &DEPLOY];

pub fn all() -> &'static [&'static Operation] {
    &OPERATIONS
}

pub fn lookup(operation_id: &str) -> Option<&'static Operation> {
    OPERATIONS.iter().copied().find(|op| op.id == operation_id)
}
