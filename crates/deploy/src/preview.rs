use regex::Regex;
use tapline_core::{Error, PodRef, PROGRAM};
use tapline_syncer::PodLister;

use crate::namespaces::targets_all;

/// Running pods the regex selects right now, in `namespace/name` order.
pub async fn matching_pods(lister: &dyn PodLister, namespaces: &[String], regex: &Regex) -> Result<Vec<PodRef>, Error> {
    let mut pods: Vec<PodRef> = lister
        .list_running(namespaces, regex)
        .await?
        .into_iter()
        .filter(|p| regex.is_match(&p.name))
        .collect();
    pods.sort_by_key(PodRef::key);
    pods.dedup_by(|a, b| a.key() == b.key());
    Ok(pods)
}

/// One `+ namespace/pod` line per match, or a single suggestion line.
pub fn preview_lines(pods: &[PodRef], namespaces: &[String], regex: &Regex) -> Vec<String> {
    if pods.is_empty() {
        return vec![no_pods_suggestion(namespaces, regex)];
    }
    pods.iter().map(|p| format!("+ {}/{}", p.namespace, p.name)).collect()
}

pub fn no_pods_suggestion(namespaces: &[String], regex: &Regex) -> String {
    let scope = if targets_all(namespaces) { "any namespace".to_string() } else { format!("namespaces [{}]", namespaces.join(", ")) };
    let mut line = format!(
        "No running pod matches the regex {regex} in {scope}. {PROGRAM} will automatically target matching pods if any are created later"
    );
    if !targets_all(namespaces) {
        line.push_str(". You can also try selecting a different namespace with -n or target all namespaces with -A");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Fixed(Vec<PodRef>);

    #[async_trait]
    impl PodLister for Fixed {
        async fn list_running(&self, _ns: &[String], _re: &Regex) -> Result<Vec<PodRef>, Error> {
            Ok(self.0.clone())
        }
    }

    fn pod(ns: &str, name: &str) -> PodRef {
        PodRef {
            name: name.into(),
            namespace: ns.into(),
            node_name: "n1".into(),
            phase: "Running".into(),
            pod_ip: "10.0.0.1".into(),
            container_statuses: vec![],
        }
    }

    #[tokio::test]
    async fn lines_are_sorted_and_deduplicated() {
        let re = Regex::new("^api").expect("re");
        let lister = Fixed(vec![pod("shop", "api-2"), pod("cart", "api-1"), pod("shop", "api-2"), pod("shop", "web-1")]);
        let ns = vec!["shop".to_string(), "cart".to_string()];
        let pods = matching_pods(&lister, &ns, &re).await.expect("listed");
        assert_eq!(preview_lines(&pods, &ns, &re), vec!["+ cart/api-1", "+ shop/api-2"]);
    }

    #[test]
    fn suggestion_mentions_namespace_flags_only_when_scoped() {
        let re = Regex::new("^api").expect("re");
        let scoped = no_pods_suggestion(&["shop".into()], &re);
        assert!(scoped.contains("-n"), "{scoped}");
        let everywhere = no_pods_suggestion(&["".into()], &re);
        assert!(everywhere.contains("any namespace"));
        assert!(!everywhere.contains("-A"));
    }
}
