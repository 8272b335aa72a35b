use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::TempDir;

use crate::core::RingConfig;

/// A ring configuration with a link name no other test (or past crashed
/// run) can collide with. The returned tempdir must outlive every
/// endpoint attached to the ring.
pub(crate) fn unique_ring(block_count: u64, block_size: u64) -> (RingConfig, TempDir) {
    static RING_ID: AtomicUsize = AtomicUsize::new(0);
    let dir = tempfile::tempdir().expect("tempdir");
    let link_name = format!(
        "shmring-test-{}-{}",
        std::process::id(),
        RING_ID.fetch_add(1, Ordering::SeqCst)
    );
    let cfg = RingConfig::builder()
        .data_dir(dir.path().to_str().unwrap().to_string())
        .link_name(link_name)
        .block_count(block_count)
        .block_size(block_size)
        .build()
        .expect("ring config");
    (cfg, dir)
}
