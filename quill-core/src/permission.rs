//! Permission Manager
//!
//! Evaluates whether a tool may run for a given agent profile, and
//! caches runtime grant/deny decisions made by the user ("always
//! allow" / "always deny" on an Ask prompt).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{AgentProfile, Permission};

/// The user's answer to an Ask prompt. The `Always*` variants are
/// written to the runtime cache for the rest of the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny,
    AlwaysAllow,
    AlwaysDeny,
}

/// Evaluates tool permissions. Cheap to share behind an `Arc`; the
/// cache is guarded by a mutex with short critical sections.
#[derive(Default)]
pub struct PermissionManager {
    cache: Mutex<HashMap<String, Permission>>,
}

impl PermissionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate the permission for a tool. First match wins:
    /// denied list, whitelist miss, explicit map, runtime cache,
    /// profile default.
    pub fn check(&self, tool_id: &str, profile: &AgentProfile) -> Permission {
        if profile.denied_tools.iter().any(|t| t == tool_id) {
            return Permission::Deny;
        }

        if !profile.allowed_tools.is_empty()
            && !profile.allowed_tools.iter().any(|t| t == tool_id)
        {
            return Permission::Deny;
        }

        if let Some(p) = profile.permissions.get(tool_id) {
            return *p;
        }

        if let Some(p) = self.cached(tool_id) {
            return p;
        }

        profile.default_permission
    }

    /// Record a permanent allow decision.
    pub fn grant(&self, tool_id: &str) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tool_id.to_string(), Permission::Allow);
    }

    /// Record a permanent deny decision.
    pub fn deny(&self, tool_id: &str) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tool_id.to_string(), Permission::Deny);
    }

    /// The cached decision for a tool, if any.
    pub fn cached(&self, tool_id: &str) -> Option<Permission> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(tool_id)
            .copied()
    }

    /// Drop all cached decisions.
    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentType;

    fn profile(default: Permission) -> AgentProfile {
        AgentProfile {
            default_permission: default,
            ..AgentProfile::for_type(AgentType::General)
        }
    }

    #[test]
    fn denied_list_wins() {
        let mgr = PermissionManager::new();
        let mut p = profile(Permission::Allow);
        p.denied_tools.push("bash".into());
        // Even an explicit Allow entry cannot override the blacklist.
        p.permissions.insert("bash".into(), Permission::Allow);
        assert_eq!(mgr.check("bash", &p), Permission::Deny);
    }

    #[test]
    fn whitelist_excludes_unlisted() {
        let mgr = PermissionManager::new();
        let mut p = profile(Permission::Allow);
        p.allowed_tools.push("read".into());
        assert_eq!(mgr.check("read", &p), Permission::Allow);
        assert_eq!(mgr.check("write", &p), Permission::Deny);
    }

    #[test]
    fn explicit_map_before_cache() {
        let mgr = PermissionManager::new();
        let mut p = profile(Permission::Ask);
        p.permissions.insert("read".into(), Permission::Allow);
        mgr.deny("read");
        assert_eq!(mgr.check("read", &p), Permission::Allow);
    }

    #[test]
    fn cache_before_default() {
        let mgr = PermissionManager::new();
        let p = profile(Permission::Ask);

        assert_eq!(mgr.check("bash", &p), Permission::Ask);

        mgr.grant("bash");
        assert_eq!(mgr.check("bash", &p), Permission::Allow);
        assert_eq!(mgr.cached("bash"), Some(Permission::Allow));

        mgr.clear_cache();
        assert_eq!(mgr.check("bash", &p), Permission::Ask);
        assert_eq!(mgr.cached("bash"), None);
    }

    #[test]
    fn deny_cached() {
        let mgr = PermissionManager::new();
        let p = profile(Permission::Ask);
        mgr.deny("write");
        assert_eq!(mgr.check("write", &p), Permission::Deny);
    }

    #[test]
    fn deterministic_with_empty_cache() {
        let mgr = PermissionManager::new();
        let p = profile(Permission::Ask);
        for _ in 0..3 {
            assert_eq!(mgr.check("anything", &p), Permission::Ask);
        }
    }
}
