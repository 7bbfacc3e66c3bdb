use crackctl_core::types::KeyRange;

#[test]
fn key_range_is_half_open() {
    let r = KeyRange::new(10, 20);
    assert!(r.contains(10));
    assert!(r.contains(19));
    assert!(!r.contains(20));
    assert_eq!(r.len(), 10);
    assert!(!r.is_empty());
}

#[test]
fn empty_key_range() {
    let r = KeyRange::new(5, 5);
    assert!(r.is_empty());
    assert_eq!(r.len(), 0);
    assert!(!r.overlaps(&KeyRange::new(0, 10)));
}

#[test]
fn skip_length_saturates() {
    let r = KeyRange::from_skip_length(u64::MAX - 1, 10);
    assert_eq!(r.end, u64::MAX);
    assert_eq!(r.len(), 1);
}

#[test]
fn adjacent_ranges_do_not_overlap() {
    let a = KeyRange::new(0, 1000);
    let b = KeyRange::new(1000, 2000);
    assert!(!a.overlaps(&b));
    assert!(a.overlaps(&KeyRange::new(999, 1001)));
}
