//! Fuzz target for identity partition allocation.
//!
//! This tests that allocation never panics on arbitrary cluster ids and
//! that every successful allocation satisfies its slice invariants.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_mirror::partition::{ClusterCapacity, IdentityPartition, IDENTITY_SPACE_BITS};

fuzz_target!(|data: (u32, bool, u32)| {
    let (cluster_id, extended, probe) = data;
    let capacity = if extended {
        ClusterCapacity::Extended
    } else {
        ClusterCapacity::Standard
    };

    // Should never panic; out-of-range ids are an Err, not a crash
    match IdentityPartition::allocate(cluster_id, capacity) {
        Ok(partition) => {
            assert!(partition.end <= 1 << IDENTITY_SPACE_BITS);
            assert_eq!(partition.len(), capacity.slice_width());
            assert!(partition.contains(partition.start));
            assert!(!partition.contains(partition.end));
            assert!(partition.is_compatible_with(capacity));

            // contains() must agree with the bit-sliced owner of the probe
            let shift = IDENTITY_SPACE_BITS - capacity.cluster_bits();
            assert_eq!(partition.contains(probe), probe >> shift == cluster_id);
        }
        Err(_) => {
            assert!(cluster_id == 0 || cluster_id > capacity.max_cluster_id());
        }
    }
});
