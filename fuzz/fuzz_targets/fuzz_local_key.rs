//! Fuzz target for local-key namespacing.
//!
//! This tests that building and parsing local keys never panics and that
//! the two stay inverse for every valid cluster name.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_mirror::config::is_valid_cluster_name;
use mesh_mirror::mirror::{local_key_for, parse_local_key};

fuzz_target!(|data: (&str, &str, &str)| {
    let (prefix, cluster, remote_key) = data;

    // Should never panic, valid name or not
    let local = local_key_for(prefix, cluster, remote_key);
    let _ = parse_local_key(prefix, &local);

    // Parsing arbitrary strings should never panic either
    let _ = parse_local_key(prefix, remote_key);

    // For valid cluster names the mapping round-trips exactly
    if is_valid_cluster_name(cluster) {
        assert_eq!(parse_local_key(prefix, &local), Some((cluster, remote_key)));
    }
});
