//! The pool as the process global allocator: every allocation in this test
//! binary, including the harness's own, goes through `PoolAlloc`.

use parpool::PoolAlloc;
use std::collections::HashMap;

#[global_allocator]
static GLOBAL: PoolAlloc = PoolAlloc;

#[test]
fn test_vec_growth() {
    let mut v: Vec<u64> = Vec::new();
    for i in 0..100_000 {
        v.push(i);
    }
    assert_eq!(v.len(), 100_000);
    assert_eq!(v[99_999], 99_999);
    v.clear();
    v.shrink_to_fit();
}

#[test]
fn test_strings_and_maps() {
    let mut map = HashMap::new();
    for i in 0..10_000 {
        map.insert(i, format!("value_{i}"));
    }
    assert_eq!(map.len(), 10_000);
    assert_eq!(map[&1234], "value_1234");
}

#[test]
fn test_boxes_and_reallocation() {
    let b = Box::new([0u8; 3000]);
    assert_eq!(b.len(), 3000);
    let mut s = String::from("x");
    for _ in 0..12 {
        let copy = s.clone();
        s.push_str(&copy);
    }
    assert_eq!(s.len(), 1 << 12);
}

#[test]
fn test_multithreaded_container_churn() {
    let handles: Vec<_> = (0..8)
        .map(|t| {
            std::thread::spawn(move || {
                let mut acc = 0usize;
                for round in 0..200 {
                    let v: Vec<usize> = (0..500).map(|i| i * t + round).collect();
                    acc = acc.wrapping_add(v.iter().sum::<usize>());
                    let s: String = v.iter().map(|x| (b'a' + (x % 26) as u8) as char).collect();
                    acc = acc.wrapping_add(s.len());
                }
                acc
            })
        })
        .collect();
    for h in handles {
        assert!(h.join().unwrap() > 0);
    }
}

#[test]
fn test_large_buffer_through_global() {
    // Lands on the cached-slab path.
    let v = vec![0xA5u8; 300_000];
    assert!(v.iter().all(|&b| b == 0xA5));
    drop(v);
    let w = vec![0x5Au8; 300_000];
    assert!(w.iter().all(|&b| b == 0x5A));
}
