//! Per-instance feature toggles for resize and refund.
//!
//! Resolution for `(instance, feature)`:
//! 1) goods-type override, then package override (`*_capabilities_json` settings);
//! 2) an explicit `false` wins immediately;
//! 3) the automation plugin's feature list, when it reports one, must contain the feature;
//! 4) an explicit `true` override, else the global `resize_enabled` / `refund_enabled` setting;
//! 5) default allow.

use crate::domain::VpsInstance;
use crate::settings::SettingsSnapshot;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Resize,
    Refund,
}

impl Feature {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Resize => "resize",
            Self::Refund => "refund",
        }
    }

    const fn global_key(self) -> &'static str {
        match self {
            Self::Resize => "resize_enabled",
            Self::Refund => "refund_enabled",
        }
    }
}

/// Maps plugin feature aliases onto the canonical names.
#[must_use]
pub fn normalize_feature_key(raw: &str) -> String {
    let key = raw.trim().to_ascii_lowercase();
    match key.as_str() {
        "upgrade" | "downgrade" => "resize".to_string(),
        "refund_request" => "refund".to_string(),
        _ => key,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct CapabilityOverride {
    #[serde(default)]
    pub resize_enabled: Option<bool>,
    #[serde(default)]
    pub refund_enabled: Option<bool>,
}

impl CapabilityOverride {
    const fn get(self, feature: Feature) -> Option<bool> {
        match feature {
            Feature::Resize => self.resize_enabled,
            Feature::Refund => self.refund_enabled,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapabilityPolicy {
    goods_types: HashMap<i64, CapabilityOverride>,
    packages: HashMap<i64, CapabilityOverride>,
    resize_enabled: Option<bool>,
    refund_enabled: Option<bool>,
}

impl CapabilityPolicy {
    #[must_use]
    pub fn from_settings(settings: &SettingsSnapshot) -> Self {
        Self {
            goods_types: overrides(settings, "goods_type_capabilities_json"),
            packages: overrides(settings, "package_capabilities_json"),
            resize_enabled: settings.bool_opt(Feature::Resize.global_key()),
            refund_enabled: settings.bool_opt(Feature::Refund.global_key()),
        }
    }

    /// `automation_features` is the plugin's advertised list; `None` or empty means unrestricted.
    #[must_use]
    pub fn allows(
        &self,
        instance: &VpsInstance,
        feature: Feature,
        automation_features: Option<&[String]>,
    ) -> bool {
        let explicit = self
            .goods_types
            .get(&instance.goods_type_id)
            .and_then(|o| o.get(feature))
            .or_else(|| {
                self.packages
                    .get(&instance.package_id)
                    .and_then(|o| o.get(feature))
            });
        if explicit == Some(false) {
            return false;
        }
        if let Some(features) = automation_features
            && !features.is_empty()
            && !features
                .iter()
                .any(|f| normalize_feature_key(f) == feature.as_str())
        {
            return false;
        }
        if explicit == Some(true) {
            return true;
        }
        let global = match feature {
            Feature::Resize => self.resize_enabled,
            Feature::Refund => self.refund_enabled,
        };
        global.unwrap_or(true)
    }
}

fn overrides(settings: &SettingsSnapshot, key: &str) -> HashMap<i64, CapabilityOverride> {
    let Some(raw) = settings.get(key) else {
        return HashMap::new();
    };
    match serde_json::from_str::<HashMap<String, CapabilityOverride>>(raw) {
        Ok(map) => map
            .into_iter()
            .filter_map(|(id, policy)| id.trim().parse::<i64>().ok().map(|id| (id, policy)))
            .collect(),
        Err(err) => {
            warn!(setting = key, "Ignoring malformed capability policy: {err}");
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance(package_id: i64, goods_type_id: i64) -> VpsInstance {
        VpsInstance {
            id: 1,
            user_id: 1,
            order_item_id: 1,
            automation_instance_id: "srv-1".to_string(),
            name: "vm".to_string(),
            region: "hk".to_string(),
            package_id,
            goods_type_id,
            cpu: 1,
            memory_gb: 1,
            disk_gb: 20,
            bandwidth_mbps: 10,
            status: "running".to_string(),
            admin_status: "normal".to_string(),
            expire_at: None,
            last_emergency_renew_at: None,
            spec: json!({}),
        }
    }

    #[test]
    fn aliases_normalize() {
        assert_eq!(normalize_feature_key(" Upgrade "), "resize");
        assert_eq!(normalize_feature_key("downgrade"), "resize");
        assert_eq!(normalize_feature_key("refund_request"), "refund");
        assert_eq!(normalize_feature_key("reinstall"), "reinstall");
    }

    #[test]
    fn defaults_to_allowed() {
        let policy = CapabilityPolicy::default();
        assert!(policy.allows(&instance(1, 1), Feature::Resize, None));
        assert!(policy.allows(&instance(1, 1), Feature::Refund, Some(&[][..])));
    }

    #[test]
    fn goods_type_beats_package_and_global() {
        let settings = SettingsSnapshot::from_pairs([
            ("goods_type_capabilities_json", r#"{"2":{"resize_enabled":true}}"#),
            ("package_capabilities_json", r#"{"5":{"resize_enabled":false}}"#),
            ("resize_enabled", "false"),
        ]);
        let policy = CapabilityPolicy::from_settings(&settings);
        assert!(policy.allows(&instance(5, 2), Feature::Resize, None));
        assert!(!policy.allows(&instance(5, 3), Feature::Resize, None));
        assert!(!policy.allows(&instance(6, 3), Feature::Resize, None));
    }

    #[test]
    fn automation_list_filters_with_aliases() {
        let policy = CapabilityPolicy::default();
        let features = vec!["upgrade".to_string(), "reinstall".to_string()];
        assert!(policy.allows(&instance(1, 1), Feature::Resize, Some(features.as_slice())));
        assert!(!policy.allows(&instance(1, 1), Feature::Refund, Some(features.as_slice())));
    }

    #[test]
    fn explicit_false_is_final() {
        let settings = SettingsSnapshot::from_pairs([
            ("package_capabilities_json", r#"{"5":{"refund_enabled":false}}"#),
            ("refund_enabled", "true"),
        ]);
        let policy = CapabilityPolicy::from_settings(&settings);
        let features = vec!["refund".to_string()];
        assert!(!policy.allows(&instance(5, 0), Feature::Refund, Some(features.as_slice())));
    }

    #[test]
    fn malformed_policy_is_ignored() {
        let settings = SettingsSnapshot::from_pairs([("package_capabilities_json", "[1,")]);
        let policy = CapabilityPolicy::from_settings(&settings);
        assert!(policy.allows(&instance(5, 0), Feature::Resize, None));
    }
}
