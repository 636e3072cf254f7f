use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Libvirt,
    Cloud,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Libvirt => "libvirt",
            Self::Cloud => "cloud",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "libvirt" => Some(Self::Libvirt),
            "cloud" => Some(Self::Cloud),
            _ => None,
        }
    }

    pub fn needs_privileges(self) -> bool {
        matches!(self, Self::Libvirt)
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InfraAction {
    Init,
    Plan,
    Apply,
    Destroy,
}

impl InfraAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        }
    }
}

impl std::fmt::Display for InfraAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    WorkingTree,
    Archive,
}

impl TransferMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkingTree => "working-tree",
            Self::Archive => "archive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "working-tree" => Some(Self::WorkingTree),
            "archive" => Some(Self::Archive),
            _ => None,
        }
    }
}

impl Default for TransferMode {
    fn default() -> Self {
        Self::Archive
    }
}

impl std::fmt::Display for TransferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
