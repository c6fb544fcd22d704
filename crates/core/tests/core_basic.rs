use profstore_core::model::{Line, LocationId, MappingId, NewLocation};
use profstore_core::version;

#[test]
fn version_is_non_empty() {
    let v = version();
    assert!(!v.is_empty());
}

#[test]
fn ids_display_as_plain_numbers() {
    assert_eq!(LocationId(42).to_string(), "42");
    assert_eq!(MappingId(7).to_string(), "7");
}

#[test]
fn addressability_requires_mapping_and_address() {
    assert!(NewLocation::new(MappingId(1), 0x10).is_addressable());
    assert!(!NewLocation::new(MappingId(1), 0).is_addressable());
    let orphan = NewLocation {
        mapping_id: None,
        address: 0x10,
        is_folded: false,
        lines: Vec::<Line>::new(),
    };
    assert!(!orphan.is_addressable());
}
