//! Tests for the buffer pools

use fcgi_host::buffer::{BufferPool, BufferPools, SMALL_REGION_SIZE};

#[test]
fn test_claim_allocates_on_empty_pool() {
    let pool = BufferPool::new(64);
    assert_eq!(pool.allocated(), 0);

    let region = pool.claim();
    assert_eq!(region.len(), 64);
    assert_eq!(pool.allocated(), 1);
    assert_eq!(pool.available(), 0);

    pool.release(region);
    assert_eq!(pool.available(), 1);
}

#[test]
fn test_released_region_is_reused() {
    let pool = BufferPool::new(32);

    let region = pool.claim();
    pool.release(region);
    let _again = pool.claim();

    assert_eq!(pool.allocated(), 1);
}

#[test]
fn test_pool_grows_by_a_third() {
    let pool = BufferPool::new(8);

    let held: Vec<_> = (0..10).map(|_| pool.claim()).collect();
    assert_eq!(pool.allocated(), 10);
    assert_eq!(pool.available(), 0);

    // exhausted with 10 allocated: the next claim adds 3 regions
    let extra = pool.claim();
    assert_eq!(pool.allocated(), 13);
    assert_eq!(pool.available(), 2);

    for region in held {
        pool.release(region);
    }
    pool.release(extra);
    assert_eq!(pool.available(), 13);
}

#[test]
fn test_clones_share_the_free_list() {
    let pool = BufferPool::new(16);
    let other = pool.clone();

    pool.release(other.claim());
    assert_eq!(pool.available(), 1);
    assert_eq!(other.available(), 1);
}

#[test]
fn test_triple_returns_regions_on_drop() {
    let pools = BufferPools::new(128);

    let triple = pools.claim_triple();
    assert_eq!(pools.small.allocated(), 2);
    assert_eq!(pools.large.allocated(), 1);
    assert_eq!(pools.small.available(), 0);

    drop(triple);
    assert_eq!(pools.small.available(), 2);
    assert_eq!(pools.large.available(), 1);
}

#[test]
fn test_triple_grows_body_region_on_demand() {
    let pools = BufferPools::new(16);
    let mut triple = pools.claim_triple();

    assert_eq!(triple.header(8).len(), 8);
    assert_eq!(triple.padding(7).len(), 7);
    assert_eq!(triple.body(10).len(), 10);

    let body = triple.body(40_000);
    assert_eq!(body.len(), 40_000);
    body[39_999] = 1;

    // the undersized body region went back to the pool right away
    assert_eq!(pools.large.available(), 1);
    assert_eq!(pools.large.allocated(), 2);

    drop(triple);
    assert_eq!(pools.large.available(), 2);
    assert_eq!(pools.large.allocated(), 2);
    assert_eq!(pools.small.available(), 2);
}

#[test]
fn test_free_list_never_exceeds_allocated_after_growth() {
    let pools = BufferPools::new(16);

    for len in [100, 1_000, 10_000] {
        let mut triple = pools.claim_triple();
        triple.body(len)[len - 1] = 1;
        assert!(pools.large.available() <= pools.large.allocated());
        drop(triple);
        assert!(pools.large.available() <= pools.large.allocated());
    }

    // every region is back, so the counts agree
    assert_eq!(pools.large.available(), pools.large.allocated());

    // an oversized region is reused like any other
    let mut triple = pools.claim_triple();
    let before = pools.large.allocated();
    assert_eq!(triple.body(20).len(), 20);
    assert_eq!(pools.large.allocated(), before);
}

#[test]
fn test_default_pools_use_small_header_regions() {
    let pools = BufferPools::default();
    assert_eq!(pools.small.suggested_size(), SMALL_REGION_SIZE);
}
