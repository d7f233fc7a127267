//! Forest behaviour under many threads.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Barrier;
use std::thread;

use forest::{Forest, ForestConfig, Key, KeyType, Near, RecordPosition};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_test_logger() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("valid default filter");

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(env_filter)
        .try_init();
}

fn bloom(dir: &Path) -> Forest {
    init_test_logger();
    Forest::bloom(dir, ForestConfig::default()).unwrap()
}

fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter(|entry| entry.as_ref().unwrap().file_type().unwrap().is_file())
        .count()
}

fn forward(forest: &Forest, tree: &str) -> Vec<(String, Vec<u8>)> {
    let mut record = forest.find_leaf_at(tree, RecordPosition::Begin).unwrap();
    let mut out = Vec::new();
    while !record.is_end() {
        out.push((record.key().unwrap().to_string(), record.read().unwrap()));
        record.move_forward().unwrap();
    }
    out
}

fn backward(forest: &Forest, tree: &str) -> Vec<(String, Vec<u8>)> {
    let mut record = forest.find_leaf_at(tree, RecordPosition::End).unwrap();
    let mut out = Vec::new();
    while !record.is_end() {
        out.push((record.key().unwrap().to_string(), record.read().unwrap()));
        record.move_back().unwrap();
    }
    out
}

fn assert_sorted(keys: &[(String, Vec<u8>)], ascending: bool) {
    for pair in keys.windows(2) {
        if ascending {
            assert!(pair[0].0 < pair[1].0, "{} then {}", pair[0].0, pair[1].0);
        } else {
            assert!(pair[0].0 > pair[1].0, "{} then {}", pair[0].0, pair[1].0);
        }
    }
}

#[test]
fn concurrent_create_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let forest = bloom(dir.path());
    forest.save_all().unwrap();
    let baseline = file_count(dir.path());

    const THREADS: usize = 10;
    const PER_THREAD: usize = 10;
    thread::scope(|s| {
        for t in 0..THREADS {
            let forest = &forest;
            s.spawn(move || {
                for i in 0..PER_THREAD {
                    let key_type = if i % 2 == 0 { KeyType::Int } else { KeyType::String };
                    forest
                        .create_tree(key_type, &format!("tree{t}_{i}"), None)
                        .unwrap();
                }
            });
        }
    });
    assert_eq!(forest.tree_names().unwrap().len(), THREADS * PER_THREAD);
    forest
        .insert_leaf("tree3_0", Key::Int(1), b"one".to_vec())
        .unwrap();

    thread::scope(|s| {
        for t in 0..THREADS {
            let forest = &forest;
            s.spawn(move || {
                for i in 0..PER_THREAD {
                    forest.delete_tree(&format!("tree{t}_{i}")).unwrap();
                }
            });
        }
    });
    assert!(forest.tree_names().unwrap().is_empty());

    forest.save_all().unwrap();
    assert_eq!(file_count(dir.path()), baseline);
}

#[test]
fn bounds_agree_across_threads() {
    let dir = tempfile::tempdir().unwrap();
    let forest = bloom(dir.path());
    forest.create_tree(KeyType::String, "letters", None).unwrap();
    for c in ('a'..='y').step_by(2) {
        forest
            .insert_leaf("letters", Key::from(c.to_string()), vec![c as u8])
            .unwrap();
    }

    let barrier = Barrier::new(16);
    thread::scope(|s| {
        for _ in 0..16 {
            let (forest, barrier) = (&forest, &barrier);
            s.spawn(move || {
                barrier.wait();
                for _ in 0..50 {
                    let lower = forest
                        .find_leaf_near("letters", &Key::from("b"), Near::Lower)
                        .unwrap();
                    assert_eq!(lower.key().unwrap(), &Key::from("a"));
                    let upper = forest
                        .find_leaf_near("letters", &Key::from("b"), Near::Upper)
                        .unwrap();
                    assert_eq!(upper.key().unwrap(), &Key::from("c"));
                }
            });
        }
    });
}

#[test]
fn scans_agree_while_other_keys_change() {
    let dir = tempfile::tempdir().unwrap();
    let forest = bloom(dir.path());
    forest.create_tree(KeyType::String, "t", Some(4)).unwrap();
    let stable: Vec<String> = (0..200).map(|n| format!("k{n:03}")).collect();
    for key in &stable {
        forest
            .insert_leaf("t", Key::from(key.as_str()), key.clone().into_bytes())
            .unwrap();
    }

    thread::scope(|s| {
        for w in 0..4 {
            let forest = &forest;
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(w);
                for _ in 0..300 {
                    // Keys interleave with the stable ones, so leaves split
                    // and merge under the scans.
                    let key = Key::from(format!("k{:03}x", rng.gen_range(0..200)));
                    if rng.gen_bool(0.6) {
                        forest.insert_leaf("t", key, b"churn".to_vec()).unwrap();
                    } else {
                        forest.erase_leaf("t", &key).unwrap();
                    }
                }
            });
        }
        for _ in 0..4 {
            let (forest, stable) = (&forest, &stable);
            s.spawn(move || {
                for _ in 0..5 {
                    let ahead = forward(forest, "t");
                    assert_sorted(&ahead, true);
                    let behind = backward(forest, "t");
                    assert_sorted(&behind, false);

                    let ahead: Vec<&String> = ahead
                        .iter()
                        .map(|(key, _)| key)
                        .filter(|key| !key.ends_with('x'))
                        .collect();
                    let mut behind: Vec<&String> = behind
                        .iter()
                        .map(|(key, _)| key)
                        .filter(|key| !key.ends_with('x'))
                        .collect();
                    behind.reverse();
                    assert_eq!(ahead, stable.iter().collect::<Vec<_>>());
                    assert_eq!(behind, ahead);
                }
            });
        }
    });
}

#[test]
fn mixed_workload() {
    let dir = tempfile::tempdir().unwrap();
    let forest = bloom(dir.path());
    forest.create_tree(KeyType::String, "squares", None).unwrap();

    let mut rng = StdRng::seed_from_u64(150);
    let mut numbers = HashSet::new();
    while numbers.len() < 190 {
        numbers.insert(rng.gen_range(0..1_000_000u64));
    }
    let numbers: Vec<u64> = numbers.into_iter().collect();
    let (initial, fresh) = numbers.split_at(150);
    for n in initial {
        let inserted = forest
            .insert_leaf("squares", Key::from(format!("p{n}")), (n * n).to_string().into_bytes())
            .unwrap();
        assert!(inserted);
    }
    let erased = &initial[..40];
    let updated = &initial[40..80];

    thread::scope(|s| {
        for i in 0..200 {
            let forest = &forest;
            let j = i / 5;
            s.spawn(move || match i % 5 {
                0 | 1 => {
                    let records = if i % 5 == 0 {
                        forward(forest, "squares")
                    } else {
                        backward(forest, "squares")
                    };
                    assert_sorted(&records, i % 5 == 0);
                    for (key, value) in records {
                        let value = String::from_utf8(value).unwrap();
                        if value != "updated" {
                            let n: u64 = key[1..].parse().unwrap();
                            assert_eq!(value, (n * n).to_string(), "value of {key}");
                        }
                    }
                }
                2 => {
                    let n = fresh[j];
                    let inserted = forest
                        .insert_leaf("squares", Key::from(format!("p{n}")), (n * n).to_string().into_bytes())
                        .unwrap();
                    assert!(inserted);
                }
                3 => {
                    assert!(forest
                        .erase_leaf("squares", &Key::from(format!("p{}", erased[j])))
                        .unwrap());
                }
                _ => forest
                    .update_leaf("squares", Key::from(format!("p{}", updated[j])), b"updated".to_vec())
                    .unwrap(),
            });
        }
    });

    let mut expected = BTreeMap::new();
    for n in initial[40..].iter().chain(fresh) {
        expected.insert(format!("p{n}"), (n * n).to_string());
    }
    for n in updated {
        expected.insert(format!("p{n}"), "updated".to_string());
    }
    let expected: Vec<(String, Vec<u8>)> = expected
        .into_iter()
        .map(|(key, value)| (key, value.into_bytes()))
        .collect();
    assert_eq!(forward(&forest, "squares"), expected);
    assert_eq!(forest.find_tree("squares").unwrap().len(), expected.len() as u64);
}

#[test]
fn reopens_with_small_caches() {
    let dir = tempfile::tempdir().unwrap();
    init_test_logger();
    let config = ForestConfig::from_yaml(
        "default_factor: 4\nintr_cache_length: 1\nleaf_cache_length: 2\nopen_files_limit: 8\n",
    )
    .unwrap();
    let expected: Vec<(String, Vec<u8>)> = (0..500)
        .map(|n| (format!("{n:04}"), vec![b'v'; n % 37]))
        .collect();
    {
        let forest = Forest::bloom(dir.path(), config.clone()).unwrap();
        forest.create_tree(KeyType::Int, "numbers", None).unwrap();
        forest.create_tree(KeyType::String, "strings", None).unwrap();
        for (key, value) in expected.iter().rev() {
            forest
                .insert_leaf("strings", Key::from(key.as_str()), value.clone())
                .unwrap();
            forest
                .insert_leaf("numbers", Key::Int(key.parse().unwrap()), value.clone())
                .unwrap();
        }
        forest.fold();
    }

    let forest = Forest::bloom(dir.path(), config).unwrap();
    assert_eq!(forest.tree_names().unwrap(), ["numbers", "strings"]);
    assert_eq!(forward(&forest, "strings"), expected);
    let mut reversed = backward(&forest, "strings");
    reversed.reverse();
    assert_eq!(reversed, expected);

    let numbers = forest.find_tree("numbers").unwrap();
    assert_eq!(numbers.factor(), 4);
    assert_eq!(numbers.len(), 500);
    drop(numbers);
    let record = forest.find_leaf("numbers", &Key::Int(36)).unwrap();
    assert_eq!(record.read().unwrap(), vec![b'v'; 36]);
}
