//! Registry path layout.

pub const NODES_ROOT: &str = "/nodes";
pub const MASTER_ROOT: &str = "/nodes/master";
pub const WORKER_ROOT: &str = "/nodes/worker";
pub const MASTER_FAILOVER_LOCK_ROOT: &str = "/lock/failover/master";

pub fn master_path(host: &str) -> String {
    format!("{}/{}", MASTER_ROOT, host)
}

pub fn worker_group_path(group: &str) -> String {
    format!("{}/{}", WORKER_ROOT, group)
}

pub fn worker_path(group: &str, host: &str) -> String {
    format!("{}/{}/{}", WORKER_ROOT, group, host)
}

pub fn master_failover_lock(dead_master: &str) -> String {
    format!("{}/{}", MASTER_FAILOVER_LOCK_ROOT, dead_master)
}

/// `path` equals `prefix` or lies beneath it.
pub fn is_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    prefix.is_empty() || path == prefix || path.strip_prefix(prefix).map_or(false, |rest| rest.starts_with('/'))
}

/// Host of a `/nodes/master/{host}` path.
pub fn parse_master_path(path: &str) -> Option<&str> {
    let host = path.strip_prefix(MASTER_ROOT)?.strip_prefix('/')?;
    (!host.is_empty() && !host.contains('/')).then_some(host)
}

/// `(group, host)` of a `/nodes/worker/{group}/{host}` path.
pub fn parse_worker_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix(WORKER_ROOT)?.strip_prefix('/')?;
    let (group, host) = rest.split_once('/')?;
    (!group.is_empty() && !host.is_empty() && !host.contains('/')).then_some((group, host))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(worker_path("etl", "10.0.0.2:1234"), "/nodes/worker/etl/10.0.0.2:1234");
        assert_eq!(parse_worker_path("/nodes/worker/etl/10.0.0.2:1234"), Some(("etl", "10.0.0.2:1234")));
        assert_eq!(parse_worker_path("/nodes/worker/etl"), None);
        assert_eq!(parse_master_path(&master_path("m1:5678")), Some("m1:5678"));
        assert_eq!(parse_master_path("/nodes/worker/x/y"), None);
    }

    #[test]
    fn test_is_under() {
        assert!(is_under("/nodes/worker/etl/h", "/nodes/worker"));
        assert!(is_under("/nodes/worker", "/nodes/worker/"));
        assert!(!is_under("/nodes/workers/etl", "/nodes/worker"));
        assert!(is_under("/anything", "/"));
    }
}
