use lamina::HashMap;

#[test]
fn later_inserts_replace_earlier_ones() {
    let map = HashMap::new().update("a", 1).update("b", 2).update("a", 3);
    assert_eq!(map.len(), 2);
    assert_eq!(map.get("a"), Some(&3));
    assert_eq!(map.get("b"), Some(&2));
    assert_eq!(map.get("c"), None);
}

#[test]
fn removal_in_a_large_map() {
    let map: HashMap<u32, String> = (0..10_000).map(|i| (i, format!("v{i}"))).collect();
    let trimmed = map.without(&5000);
    assert_eq!(trimmed.len(), 9999);
    assert!(!trimmed.contains_key(&5000));
    assert!(trimmed.contains_key(&4999));
    assert_eq!(map.len(), 10_000);
    assert_eq!(map.get(&5000).map(String::as_str), Some("v5000"));
}

#[test]
fn alter_and_get_or_insert_with() {
    let mut counters: HashMap<&str, u32> = HashMap::new();
    for word in ["apple", "pear", "apple", "plum", "apple"] {
        counters.alter(word, |n| Some(n.unwrap_or(0) + 1));
    }
    assert_eq!(counters.get("apple"), Some(&3));
    assert_eq!(counters.get("pear"), Some(&1));

    assert_eq!(*counters.get_or_insert_with("quince", || 0), 0);
    assert_eq!(*counters.get_or_insert_with("apple", || 0), 3);
    assert_eq!(counters.len(), 4);
}

#[test]
fn retain_keeps_what_the_predicate_admits() {
    let mut map: HashMap<u32, u32> = (0..1000).map(|i| (i, i * 2)).collect();
    map.retain(|key, _| key % 3 == 0);
    assert_eq!(map.len(), 334);
    assert_eq!(map.get(&999), Some(&1998));
    assert_eq!(map.get(&998), None);
}

#[test]
fn merge_prefers_the_argument_on_conflicts() {
    let mut base: HashMap<u32, &str> = (0..10).map(|i| (i, "base")).collect();
    let other: HashMap<u32, &str> = (5..15).map(|i| (i, "other")).collect();
    base.merge(&other);
    assert_eq!(base.len(), 15);
    assert_eq!(base.get(&3), Some(&"base"));
    assert_eq!(base.get(&7), Some(&"other"));
    assert_eq!(base.get(&12), Some(&"other"));
}

#[test]
fn borrowed_lookups() {
    let mut map: HashMap<String, u32> = HashMap::new();
    map.insert("owned".to_string(), 1);
    assert_eq!(map.get("owned"), Some(&1));
    assert!(map.contains_key("owned"));
    assert_eq!(map.remove("owned"), Some(1));
    assert!(map.is_empty());
}
