//! Maximum remote wait per (resource type, operation kind).
//!
//! The table is plain data. Deployments can replace it from a YAML file; the
//! engine only ever calls [`TimeoutPolicy::resolve`].

use crate::operation::OperationKind;
use crate::resource::ResourceType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutRule {
    pub resource_type: ResourceType,
    /// `None` matches every kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<OperationKind>,
    pub timeout_secs: u64,
}

impl TimeoutRule {
    pub fn any(resource_type: ResourceType, timeout_secs: u64) -> Self {
        Self {
            resource_type,
            kind: None,
            timeout_secs,
        }
    }

    pub fn for_kind(resource_type: ResourceType, kind: OperationKind, timeout_secs: u64) -> Self {
        Self {
            resource_type,
            kind: Some(kind),
            timeout_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    #[serde(default = "default_timeout_secs")]
    pub default_secs: u64,
    #[serde(default)]
    pub rules: Vec<TimeoutRule>,
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        use OperationKind::{Create, Delete};
        use ResourceType::*;

        Self {
            default_secs: default_timeout_secs(),
            rules: vec![
                TimeoutRule::any(StorageAccount, 180),
                TimeoutRule::any(NetworkSecurityGroup, 180),
                TimeoutRule::any(VirtualNetwork, 180),
                TimeoutRule::for_kind(ResourceGroup, Create, 60),
                TimeoutRule::for_kind(ResourceGroup, Delete, 600),
                TimeoutRule::any(Bastion, 600),
                TimeoutRule::any(VirtualMachine, 600),
            ],
        }
    }
}

impl TimeoutPolicy {
    /// A rule naming the kind wins over a rule for any kind; unmatched pairs
    /// get the default.
    pub fn resolve(&self, resource_type: ResourceType, kind: OperationKind) -> Duration {
        let matching = || {
            self.rules
                .iter()
                .filter(move |rule| rule.resource_type == resource_type)
        };

        let secs = matching()
            .find(|rule| rule.kind == Some(kind))
            .or_else(|| matching().find(|rule| rule.kind.is_none()))
            .map(|rule| rule.timeout_secs)
            .unwrap_or(self.default_secs);

        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OperationKind::*;
    use ResourceType::*;

    #[test]
    fn default_table() {
        let policy = TimeoutPolicy::default();

        assert_eq!(policy.resolve(StorageAccount, Create), Duration::from_secs(180));
        assert_eq!(policy.resolve(StorageAccount, Delete), Duration::from_secs(180));
        assert_eq!(policy.resolve(NetworkSecurityGroup, Update), Duration::from_secs(180));
        assert_eq!(policy.resolve(VirtualNetwork, Create), Duration::from_secs(180));
        assert_eq!(policy.resolve(ResourceGroup, Create), Duration::from_secs(60));
        assert_eq!(policy.resolve(ResourceGroup, Delete), Duration::from_secs(600));
        assert_eq!(policy.resolve(Bastion, Delete), Duration::from_secs(600));
        assert_eq!(policy.resolve(VirtualMachine, Create), Duration::from_secs(600));
    }

    #[test]
    fn unmatched_pairs_use_default() {
        let policy = TimeoutPolicy::default();

        assert_eq!(policy.resolve(ResourceGroup, Update), Duration::from_secs(60));
        assert_eq!(policy.resolve(Disk, Create), Duration::from_secs(60));
        assert_eq!(policy.resolve(PublicIpAddress, Delete), Duration::from_secs(60));
    }

    #[test]
    fn kind_specific_rule_beats_catch_all() {
        let policy = TimeoutPolicy {
            default_secs: 30,
            rules: vec![
                TimeoutRule::any(Disk, 120),
                TimeoutRule::for_kind(Disk, Delete, 900),
            ],
        };

        assert_eq!(policy.resolve(Disk, Delete), Duration::from_secs(900));
        assert_eq!(policy.resolve(Disk, Create), Duration::from_secs(120));
        assert_eq!(policy.resolve(Bastion, Create), Duration::from_secs(30));
    }

    #[test]
    fn loads_from_yaml() {
        let yaml = r#"
default_secs: 45
rules:
  - resource_type: network_interface
    timeout_secs: 240
  - resource_type: resource_group
    kind: delete
    timeout_secs: 1200
"#;
        let policy: TimeoutPolicy = serde_yaml_ng::from_str(yaml).unwrap();

        assert_eq!(policy.resolve(NetworkInterface, Create), Duration::from_secs(240));
        assert_eq!(policy.resolve(ResourceGroup, Delete), Duration::from_secs(1200));
        assert_eq!(policy.resolve(ResourceGroup, Create), Duration::from_secs(45));
    }
}
