mod common;

use common::{TestArray, blob};
use largearray::{Config, Error};

#[test]
fn test_append_and_get() {
    let mut t = TestArray::new(4);
    let array = t.array();
    array.append(b"alpha").unwrap();
    array.append(b"").unwrap();
    array.append(b"gamma").unwrap();

    assert_eq!(array.count(), 3);
    assert_eq!(array.total_used_bytes(), 10);
    assert_eq!(array.get(0).unwrap(), b"alpha");
    assert!(array.get(1).unwrap().is_empty());
    assert_eq!(array.get(2).unwrap(), b"gamma");
    assert_eq!(array.element_len(2).unwrap(), 5);
    assert_eq!(array.get_prefix(0, 3).unwrap(), b"alp");
}

#[test]
fn test_out_of_range_is_typed_error() {
    let mut t = TestArray::new(4);
    let array = t.array();
    array.append(b"x").unwrap();

    assert!(matches!(array.get(1), Err(Error::Bounds { position: 1, count: 1 })));
    assert!(matches!(array.set(5, b"y"), Err(Error::Bounds { .. })));
    assert!(matches!(array.remove(1), Err(Error::Bounds { .. })));
    assert!(matches!(array.insert(3, b"z"), Err(Error::Bounds { .. })));
    assert!(matches!(array.remove_range(0..2), Err(Error::Bounds { .. })));
    // nothing changed
    assert_eq!(array.count(), 1);
    array.check_integrity().unwrap();
}

#[test]
fn test_split_correctness() {
    let mut t = TestArray::new(10);
    let elements: Vec<Vec<u8>> = (0..11u8).map(|i| blob(i, 16)).collect();
    for element in &elements {
        t.array().append(element).unwrap();
    }

    let pages = t.array().page_chain_info().unwrap();
    assert_eq!(pages.len(), 2);
    assert_eq!(pages.iter().map(|p| p.count).sum::<u64>(), 11);
    assert!(pages.iter().all(|p| p.count <= 10));
    assert_eq!(pages[0].next, pages[1].address);
    assert_eq!(pages[1].prev, pages[0].address);
    assert_eq!(t.contents(), elements);
}

#[test]
fn test_remove_range_scenario() {
    let mut t = TestArray::new(10);
    for i in 0..25u64 {
        t.array().append(&blob((i % 128) as u8, 10)).unwrap();
    }
    assert_eq!(t.page_counts(), vec![10, 10, 5]);

    t.array().remove_range(10..20).unwrap();
    assert_eq!(t.array().count(), 15);
    assert_eq!(t.array().get(10).unwrap(), blob(20, 10));
    assert_eq!(t.page_counts(), vec![10, 5]);
    t.array().check_integrity().unwrap();
}

#[test]
fn test_chunk_chain_roundtrip_across_chunks() {
    // 132-byte chunks carry 100 payload bytes after the link header
    let config = Config::new()
        .with_max_elements_per_page(4)
        .with_min_allocation_size(64)
        .with_max_chunk_size(132);
    let mut t = TestArray::with_config(config);

    let element: Vec<u8> = (0..250u32).map(|i| (i * 7 % 256) as u8).collect();
    t.array().append(&element).unwrap();
    assert_eq!(t.array().get(0).unwrap(), element);
    assert_eq!(t.array().get_prefix(0, 120).unwrap(), &element[..120]);

    t.reopen();
    assert_eq!(t.array().get(0).unwrap(), element);
}

#[test]
fn test_insert_positions() {
    let mut t = TestArray::new(3);
    let array = t.array();
    array.insert(0, b"b").unwrap();
    array.insert(0, b"a").unwrap();
    array.insert(2, b"d").unwrap();
    array.insert(2, b"c").unwrap();
    array.insert(4, b"e").unwrap();
    array.insert(1, b"a2").unwrap();

    assert_eq!(
        t.contents(),
        vec![b"a".to_vec(), b"a2".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec(), b"e".to_vec()]
    );
    t.array().check_integrity().unwrap();
}

#[test]
fn test_set_relocates_and_updates_in_place() {
    let mut t = TestArray::new(4);
    let array = t.array();
    array.append(&blob(1, 100)).unwrap();
    array.append(&blob(2, 10)).unwrap();

    array.set(0, &blob(3, 20)).unwrap();
    array.set(1, &blob(4, 900)).unwrap();
    array.set(0, b"").unwrap();

    assert!(array.get(0).unwrap().is_empty());
    assert_eq!(array.get(1).unwrap(), blob(4, 900));
    assert_eq!(array.total_used_bytes(), 900);
    array.check_integrity().unwrap();
}

/// Run a seeded random mix of operations against a `Vec` model
fn check_mixed_operations(config: Config, mut seed: u64, steps: u64) {
    let mut t = TestArray::with_config(config);
    let mut model: Vec<Vec<u8>> = Vec::new();

    // deterministic LCG so failures reproduce
    let mut next = |bound: u64| {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (seed >> 33) % bound.max(1)
    };

    for step in 0..steps {
        let len = next(300) as usize;
        let tag = (step % 251) as u8;
        let array = t.array();
        match next(10) {
            0..=2 => {
                array.append(&blob(tag, len)).unwrap();
                model.push(blob(tag, len));
            }
            3..=5 => {
                let at = next(model.len() as u64 + 1);
                array.insert(at, &blob(tag, len)).unwrap();
                model.insert(at as usize, blob(tag, len));
            }
            6..=7 if !model.is_empty() => {
                let at = next(model.len() as u64);
                array.remove(at).unwrap();
                model.remove(at as usize);
            }
            8 if !model.is_empty() => {
                let at = next(model.len() as u64);
                array.set(at, &blob(tag, len)).unwrap();
                model[at as usize] = blob(tag, len);
            }
            _ if !model.is_empty() => {
                let at = next(model.len() as u64);
                assert_eq!(array.get(at).unwrap(), model[at as usize], "step {}", step);
            }
            _ => {}
        }

        let array = t.array();
        assert_eq!(array.count(), model.len() as u64);
        if step % 50 == 0 {
            array.check_integrity().unwrap();
            let pages = array.page_chain_info().unwrap();
            assert_eq!(pages.iter().map(|p| p.count).sum::<u64>(), model.len() as u64);
        }
    }

    let used: u64 = model.iter().map(|e| e.len() as u64).sum();
    assert_eq!(t.array().total_used_bytes(), used);
    assert_eq!(t.contents(), model);

    t.reopen();
    t.array().check_integrity().unwrap();
    assert_eq!(t.contents(), model);
}

#[test]
fn test_count_invariant_under_mixed_operations() {
    let config = Config::new()
        .with_max_elements_per_page(4)
        .with_min_allocation_size(64)
        .with_max_chunk_size(160)
        .with_page_cache_capacity(2);
    check_mixed_operations(config, 0x2545_f491_4f6c_dd1d, 600);
}

#[test]
fn test_mixed_operations_on_small_pages() {
    for seed in 1..=8u64 {
        let config = Config::new()
            .with_max_elements_per_page(3)
            .with_min_allocation_size(64)
            .with_page_cache_capacity(2)
            .with_write_back_threshold(1);
        check_mixed_operations(config, seed, 300);
    }
}

#[test]
fn test_insert_after_rebalance_lands_in_right_page() {
    let mut t = TestArray::new(3);
    for i in 0..6u8 {
        t.array().append(&[i]).unwrap();
    }
    t.array().remove(5).unwrap();
    t.array().get(0).unwrap();
    assert_eq!(t.page_counts(), vec![3, 2]);

    t.array().insert(3, b"x").unwrap();
    assert_eq!(
        t.contents(),
        vec![vec![0], vec![1], vec![2], b"x".to_vec(), vec![3], vec![4]]
    );
    t.array().check_integrity().unwrap();
}

#[test]
fn test_space_reclamation() {
    let mut t = TestArray::new(8);
    let n = 20u64;
    let size = 200usize;
    for i in 0..n {
        t.array().append(&blob(i as u8, size)).unwrap();
    }
    let free_before = t.array().total_free_bytes();

    for _ in 0..n {
        t.array().remove(0).unwrap();
    }
    assert!(t.array().is_empty());
    assert!(t.array().total_free_bytes() >= free_before + n * size as u64);

    let len = t.file_len();
    t.array().append(&blob(9, size)).unwrap();
    assert_eq!(t.file_len(), len);
    assert_eq!(t.array().get(0).unwrap(), blob(9, size));
}

#[test]
fn test_cache_bound_through_array() {
    let config = Config::new()
        .with_max_elements_per_page(2)
        .with_min_allocation_size(64)
        .with_page_cache_capacity(3);
    let mut t = TestArray::with_config(config);
    for i in 0..8u8 {
        t.array().append(&[i]).unwrap();
    }
    t.reopen();

    // one element from each of the four pages
    for position in [0, 2, 4, 6] {
        t.array().get(position).unwrap();
    }
    let stats = t.array().cache_stats();
    assert_eq!(stats.misses, 4);
    assert_eq!(stats.evictions, 1);

    t.array().get(0).unwrap();
    let stats = t.array().cache_stats();
    assert_eq!(stats.misses, 5);
    assert_eq!(stats.evictions, 2);
}

#[test]
fn test_iteration_is_restartable() {
    let mut t = TestArray::new(3);
    for i in 0..7u8 {
        t.array().append(&[i]).unwrap();
    }
    let first = t.contents();
    let second = t.contents();
    assert_eq!(first, second);
    assert_eq!(first.len(), 7);

    let mut iter = t.array().iter();
    assert_eq!(iter.size_hint(), (7, Some(7)));
    assert_eq!(iter.next().unwrap().unwrap(), vec![0]);
}

#[test]
fn test_file_size_limit_leaves_array_usable() {
    let config = Config::new()
        .with_max_elements_per_page(4)
        .with_min_allocation_size(64)
        .with_max_file_size(4096);
    let mut t = TestArray::with_config(config);
    t.array().append(b"small").unwrap();

    let err = t.array().append(&blob(1, 10_000)).unwrap_err();
    assert!(matches!(err, Error::Capacity(_)));
    assert_eq!(t.array().count(), 1);
    assert_eq!(t.array().get(0).unwrap(), b"small");
    t.array().append(b"still fits").unwrap();
    t.array().check_integrity().unwrap();
}
