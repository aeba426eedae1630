// Metadata store layout used by the cluster coordinator.
//
// /cluster/register/{broker_id}  - brokers known to the lock-holding controller, with TTL
// /cluster/locks/{name}          - named distributed locks
// /cluster/controllers/{id}      - live controller instances, with TTL

pub(crate) const BASE_CLUSTER_PATH: &str = "/cluster";
pub(crate) const BASE_REGISTER_PATH: &str = "/cluster/register";
pub(crate) const BASE_LOCKS_PATH: &str = "/cluster/locks";
pub(crate) const BASE_CONTROLLERS_PATH: &str = "/cluster/controllers";

/// Lock serializing fleet mutations across controller instances.
pub(crate) const SCALING_LOCK: &str = "scaling";

pub(crate) fn join_path(parts: &[&str]) -> String {
    let mut path = String::new();
    for part in parts {
        let trimmed = part.trim_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        path.push('/');
        path.push_str(trimmed);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_path_normalizes_slashes() {
        assert_eq!(join_path(&[BASE_REGISTER_PATH, "b1"]), "/cluster/register/b1");
        assert_eq!(join_path(&["/cluster/", "/locks/", "scaling"]), "/cluster/locks/scaling");
        assert_eq!(join_path(&[BASE_CLUSTER_PATH]), "/cluster");
    }
}
