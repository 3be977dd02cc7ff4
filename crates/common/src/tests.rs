use super::*;

#[test]
fn config_defaults_match_builder() {
    let built = Config::builder().build();
    let default = Config::default();
    assert_eq!(built.page_size, default.page_size);
    assert_eq!(built.max_bufs, default.max_bufs);
    assert_eq!(built.ftab_size, default.ftab_size);
    assert_eq!(built.max_scans, default.max_scans);
    assert_eq!(built.hash_buckets, default.hash_buckets);
    assert_eq!(built.max_attr_len, default.max_attr_len);
    assert_eq!(built.eviction, default.eviction);
}

#[test]
fn rid_equality_and_hash_by_value() {
    let a = Rid { page: 3, slot: 7 };
    let b = Rid { page: 3, slot: 7 };
    let c = Rid { page: 3, slot: 8 };
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn io_errors_convert() {
    fn fails() -> Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))?;
        Ok(())
    }
    assert!(matches!(fails(), Err(Error::Io(_))));
}
