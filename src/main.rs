use crossbeam_epoch as epoch;
use split_ordered_hash_table::HashTable;

fn main() {
    env_logger::init();

    let table = HashTable::<u32, u32>::new();
    let guard = epoch::pin();

    assert_eq!(table.put(37, 37, &guard), None);
    assert_eq!(table.get(&42, &guard), None);
    assert_eq!(table.get(&37, &guard), Some(&37));

    assert_eq!(table.put(42, 42, &guard), None);
    assert_eq!(table.get(&42, &guard), Some(&42));
    assert_eq!(table.get(&37, &guard), Some(&37));

    assert_eq!(table.delete(&37, &guard), Some(&37));
    assert_eq!(table.get(&42, &guard), Some(&42));
    assert_eq!(table.get(&37, &guard), None);

    assert_eq!(table.delete(&37, &guard), None);

    for key in 0..5000u32 {
        table.put(key, key * key, &guard);
    }
    table.verify().expect("a freshly built table should satisfy its invariants");

    log::info!("{}", table.describe().lines().next().unwrap());
}
