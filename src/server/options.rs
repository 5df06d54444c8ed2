//! Server option lists: harness-only pseudo options and order-insensitive
//! comparison.

/// Options that steer the harness and are never passed to the server.
pub const PSEUDO_OPTIONS: &[&str] = &["--restart", "--skip-stack-trace", "--skip-core-file"];

/// Drop harness-only pseudo options, keeping order.
pub fn filter_server_options(options: &[String]) -> Vec<String> {
    options
        .iter()
        .filter(|opt| !PSEUDO_OPTIONS.contains(&opt.as_str()))
        .cloned()
        .collect()
}

/// Two option lists match when their sorted forms are identical.
/// Order is insignificant, duplicates are not.
pub fn compare_options(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a: Vec<&str> = a.iter().map(String::as_str).collect();
    let mut b: Vec<&str> = b.iter().map(String::as_str).collect();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}

/// Whether the case asks for a server restart even with matching options.
pub fn wants_restart(options: &[String]) -> bool {
    options.iter().any(|opt| opt == "--restart")
}
