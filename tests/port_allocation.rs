//! Port catalog behavior across independent managers sharing one file,
//! the way two harness runs on one machine share `/tmp`.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Arc;

use qprunner::ports::{PortManager, PortProbe};

struct AlwaysFree;

impl PortProbe for AlwaysFree {
    fn is_free(&self, _port: u16) -> bool {
        true
    }
}

fn manager(path: &std::path::Path) -> PortManager {
    PortManager::with_probe(path, Box::new(AlwaysFree))
}

#[test]
fn test_two_managers_never_share_ports() {
    let dir = tempfile::TempDir::new().unwrap();
    let catalog = dir.path().join("ports.catalog");
    let first = manager(&catalog);
    let second = manager(&catalog);

    let a = first.get_port_block("bot0.server0", 9306, 5).unwrap();
    let b = second.get_port_block("bot0.server0", 9306, 5).unwrap();

    assert_eq!(a.ports(), [9306, 9307, 9308, 9309, 9310]);
    assert_eq!(b.ports(), [9311, 9312, 9313, 9314, 9315]);
    assert_eq!(first.reserved_ports().unwrap().len(), 10);
}

#[test]
fn test_concurrent_allocation_is_unique() {
    let dir = tempfile::TempDir::new().unwrap();
    let catalog = Arc::new(dir.path().join("ports.catalog"));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let catalog = Arc::clone(&catalog);
            std::thread::spawn(move || {
                let pm = manager(&catalog);
                let lease = pm.get_port_block(&format!("bot{i}.server0"), 9306, 5).unwrap();
                let ports = lease.ports().to_vec();
                std::mem::forget(lease);
                ports
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for port in handle.join().unwrap() {
            assert!(seen.insert(port), "port {port} handed out twice");
        }
    }
    assert_eq!(seen.len(), 40);
    assert_eq!(manager(&catalog).reserved_ports().unwrap().len(), 40);
}

#[test]
fn test_release_is_idempotent_across_managers() {
    let dir = tempfile::TempDir::new().unwrap();
    let catalog = dir.path().join("ports.catalog");
    let pm = manager(&catalog);
    let mut lease = pm.get_port_block("bot0.server0", 9306, 5).unwrap();
    let ports = lease.ports().to_vec();

    lease.release().unwrap();
    let other = manager(&catalog);
    other.free_ports(&ports).unwrap();
    other.free_port(9306).unwrap();
    assert!(pm.reserved_ports().unwrap().is_empty());

    drop(lease);
    assert!(other.reserved_ports().unwrap().is_empty());
}

#[test]
fn test_owner_labels_name_the_requester() {
    let dir = tempfile::TempDir::new().unwrap();
    let pm = manager(&dir.path().join("ports.catalog"));
    let _lease = pm.get_port_block("bot0.server1", 9400, 1).unwrap();

    let reserved = pm.reserved_ports().unwrap();
    let owner = &reserved[&9400];
    assert_eq!(owner, &format!("bot0.server1@{}", std::process::id()));
    assert!(pm.purge_stale().unwrap().is_empty());
}

#[test]
fn test_ports_bound_by_the_os_are_skipped() {
    let dir = tempfile::TempDir::new().unwrap();
    let (port, _listener) = (20000u16..30000)
        .find_map(|p| TcpListener::bind(("0.0.0.0", p)).ok().map(|l| (p, l)))
        .expect("no bindable port in range");

    let pm = PortManager::new(dir.path().join("ports.catalog"));
    let lease = pm.get_port_block("bot0.server0", port, 5).unwrap();

    assert!(!lease.ports().contains(&port), "{port} is in use but was handed out");
    assert_eq!(lease.ports().len(), 5);
}
