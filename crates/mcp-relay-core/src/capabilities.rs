//! Capability set parsing (§4.5): the upstream's negotiated `capabilities`
//! object determines which Proxy Bridge handlers get installed and which
//! notification kinds get relayed.

use serde_json::Value;

/// The default capability set assumed for a connection promoted to the
/// global singleton fallback (§4.6 step 6, §9 open question: this is a
/// compatibility assumption, not something every upstream is guaranteed to
/// match).
pub fn default_global_capabilities() -> Value {
    serde_json::json!({
        "tools": {},
        "resources": {},
        "prompts": {},
        "logging": {},
    })
}

/// A parsed view over the capability object, answering the §4.5 table's
/// "capability present?" questions.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub prompts: bool,
    pub resources: bool,
    pub resources_subscribe: bool,
    pub tools: bool,
    pub logging: bool,
}

impl Capabilities {
    pub fn from_value(value: &Value) -> Self {
        let has = |key: &str| value.get(key).is_some();
        let resources_subscribe = value
            .get("resources")
            .and_then(|r| r.get("subscribe"))
            .map(|s| s.as_bool().unwrap_or(true))
            .unwrap_or(false);

        Self {
            prompts: has("prompts"),
            resources: has("resources"),
            resources_subscribe,
            tools: has("tools"),
            logging: has("logging"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_object_yields_no_capabilities() {
        let caps = Capabilities::from_value(&json!({}));
        assert!(!caps.tools);
        assert!(!caps.prompts);
        assert!(!caps.resources);
        assert!(!caps.resources_subscribe);
        assert!(!caps.logging);
    }

    #[test]
    fn detects_each_top_level_capability() {
        let caps = Capabilities::from_value(&json!({
            "tools": {}, "prompts": {}, "resources": {}, "logging": {}
        }));
        assert!(caps.tools);
        assert!(caps.prompts);
        assert!(caps.resources);
        assert!(caps.logging);
        assert!(!caps.resources_subscribe);
    }

    #[test]
    fn detects_resources_subscribe_nested_flag() {
        let caps = Capabilities::from_value(&json!({
            "resources": { "subscribe": true }
        }));
        assert!(caps.resources);
        assert!(caps.resources_subscribe);
    }

    #[test]
    fn default_global_capabilities_has_the_four_empty_buckets() {
        let caps = Capabilities::from_value(&default_global_capabilities());
        assert!(caps.tools && caps.resources && caps.prompts && caps.logging);
        assert!(!caps.resources_subscribe);
    }
}
