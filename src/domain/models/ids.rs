//! Opaque prefixed identifiers.
//!
//! Every entity carries a stable string id with a short type prefix
//! (`agt_`, `ftr_`, `itv_`, `wta_`). Ids are content-free and comparable
//! only for equality.

use uuid::Uuid;

/// Length of the random portion of a generated id.
const ID_SUFFIX_LEN: usize = 12;

/// Generate a new id with the given type prefix.
pub fn new_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..ID_SUFFIX_LEN])
}

/// Id for an agent subprocess.
pub fn agent_id() -> String {
    new_id("agt")
}

/// Id for a feature being worked by agents.
pub fn feature_id() -> String {
    new_id("ftr")
}

/// Id for an intervention request.
pub fn intervention_id() -> String {
    new_id("itv")
}

/// Id for a worktree allocation.
pub fn allocation_id() -> String {
    new_id("wta")
}

/// Short suffix of an id, suitable for branch names and log lines.
///
/// Takes up to eight characters of the portion after the last underscore.
pub fn short_suffix(id: &str) -> String {
    let tail = id.rsplit('_').next().unwrap_or(id);
    tail.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_has_prefix() {
        let id = allocation_id();
        assert!(id.starts_with("wta_"));
        assert_eq!(id.len(), "wta_".len() + ID_SUFFIX_LEN);

        assert!(feature_id().starts_with("ftr_"));
        assert!(intervention_id().starts_with("itv_"));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = agent_id();
        let b = agent_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_suffix() {
        assert_eq!(short_suffix("agt_abcdef123456"), "abcdef12");
        assert_eq!(short_suffix("noprefix"), "noprefix");
        assert_eq!(short_suffix("a_b"), "b");
    }
}
