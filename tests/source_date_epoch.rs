//! `SOURCE_DATE_EPOCH` handling, isolated in its own test binary because it
//! mutates the process environment

use sqfs_ng::fstree::Fstree;

#[test]
fn test_source_date_epoch_feeds_default_mtime() {
    std::env::set_var("SOURCE_DATE_EPOCH", "1571142600");
    let fs = Fstree::new(None).unwrap();
    assert_eq!(fs.defaults.mtime, 1571142600);

    // an explicit mtime wins
    let fs = Fstree::new(Some("mtime=42")).unwrap();
    assert_eq!(fs.defaults.mtime, 42);

    // unparsable values fall back to zero
    std::env::set_var("SOURCE_DATE_EPOCH", "not-a-number");
    let fs = Fstree::new(None).unwrap();
    assert_eq!(fs.defaults.mtime, 0);

    // as do values that do not fit 32 bits
    std::env::set_var("SOURCE_DATE_EPOCH", "99999999999");
    let fs = Fstree::new(None).unwrap();
    assert_eq!(fs.defaults.mtime, 0);

    std::env::remove_var("SOURCE_DATE_EPOCH");
    let fs = Fstree::new(None).unwrap();
    assert_eq!(fs.defaults.mtime, 0);
}
