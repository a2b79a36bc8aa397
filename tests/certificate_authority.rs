use std::collections::HashSet;
use std::sync::Arc;

use intercept_proxy::ca::{CaStore, CertificateAuthority};
use x509_parser::prelude::*;

fn subject_and_issuer(der: &[u8]) -> (String, String) {
    let (_, cert) = parse_x509_certificate(der).expect("Failed to parse certificate");
    (cert.subject().to_string(), cert.issuer().to_string())
}

#[test]
fn test_distinct_hosts_chain_to_one_root() {
    let ca = CertificateAuthority::new();
    let root = ca.root_certificate().expect("Failed to create root");
    let (root_subject, _) = subject_and_issuer(root.cert_der());

    let hosts = ["api.example.com", "cdn.example.net", "127.0.0.1"];
    let mut subjects = HashSet::new();

    for host in hosts {
        let leaf = ca.certificate_for_host(host).expect("Failed to issue leaf");
        let (subject, issuer) = subject_and_issuer(leaf.cert_der());

        assert_eq!(issuer, root_subject, "leaf for {} not issued by root", host);
        assert_eq!(leaf.root_serial(), root.serial());
        assert!(subjects.insert(subject), "duplicate subject for {}", host);
    }

    assert_eq!(ca.len(), hosts.len());
}

#[test]
fn test_concurrent_requests_issue_once() {
    let ca = Arc::new(CertificateAuthority::new());

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let ca = ca.clone();
            std::thread::spawn(move || ca.certificate_for_host("busy.example.com").unwrap())
        })
        .collect();

    let entries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let first = &entries[0];
    for entry in &entries {
        assert!(Arc::ptr_eq(first, entry));
    }
    assert_eq!(ca.cached_hosts(), vec!["busy.example.com".to_string()]);
}

#[tokio::test]
async fn test_concurrent_async_callers_share_leaf() {
    let ca = Arc::new(CertificateAuthority::new());

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let ca = ca.clone();
            tokio::task::spawn_blocking(move || ca.certificate_for_host("async.example.com"))
        })
        .collect();

    let mut serials = HashSet::new();
    for task in tasks {
        let entry = task.await.unwrap().unwrap();
        serials.insert(entry.serial().to_vec());
    }

    assert_eq!(serials.len(), 1);
    assert_eq!(ca.len(), 1);
}

#[test]
fn test_persisted_root_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let first = CertificateAuthority::with_store(CaStore::new(dir.path()));
    let serial = first.root_certificate().unwrap().serial().to_vec();
    assert!(CaStore::new(dir.path()).exists());

    let second = CertificateAuthority::with_store(CaStore::new(dir.path()));
    assert_eq!(second.root_certificate().unwrap().serial(), serial.as_slice());
}

#[test]
fn test_reset_issues_new_root() {
    let ca = CertificateAuthority::new();
    let old_root = ca.root_certificate().unwrap().serial().to_vec();
    ca.certificate_for_host("before.example.com").unwrap();

    ca.reset().unwrap();

    assert!(ca.is_empty());
    let leaf = ca.certificate_for_host("after.example.com").unwrap();
    assert_ne!(leaf.root_serial(), old_root.as_slice());
}
