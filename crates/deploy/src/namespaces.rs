use tapline_core::ALL_NAMESPACES;

/// Namespaces to target: an explicit list wins, then `-A`, then the
/// operator's current namespace.
pub fn resolve_namespaces(explicit: &[String], all_namespaces: bool, current: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for ns in explicit.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if !out.iter().any(|seen| seen == ns) {
            out.push(ns.to_string());
        }
    }
    if !out.is_empty() {
        return out;
    }
    if all_namespaces {
        return vec![ALL_NAMESPACES.to_string()];
    }
    vec![current.to_string()]
}

pub fn targets_all(namespaces: &[String]) -> bool {
    namespaces.iter().any(|n| n == ALL_NAMESPACES)
}
