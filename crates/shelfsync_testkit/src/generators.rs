//! Property-based test generators using proptest.

use proptest::prelude::*;
use serde_json::{json, Value};
use shelfsync_protocol::{EntityId, EntityRef, FieldMap, UpdateFields};

/// Field names editors touch on a book.
pub const BOOK_FIELDS: [&str; 5] = ["title", "subtitle", "description", "language", "publisher"];

/// Strategy for server-assigned entity ids.
pub fn entity_id_strategy() -> impl Strategy<Value = EntityId> {
    prop::string::string_regex("[a-z0-9]{1,12}")
        .expect("Invalid regex")
        .prop_map(EntityId::new)
}

/// Strategy for one of `count` books (`b0`, `b1`, ...).
pub fn book_ref_strategy(count: usize) -> impl Strategy<Value = EntityRef> {
    (0..count.max(1)).prop_map(|i| EntityRef::book(format!("b{i}")))
}

/// Strategy for field values, including `null` (clear).
pub fn field_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        4 => "[A-Za-z ]{0,24}".prop_map(Value::String),
        1 => any::<u32>().prop_map(|n| json!(n)),
        1 => any::<bool>().prop_map(Value::Bool),
        1 => Just(Value::Null),
    ]
}

/// Strategy for a non-empty patch of book fields.
pub fn field_patch_strategy() -> impl Strategy<Value = FieldMap> {
    prop::collection::btree_map(
        prop::sample::select(BOOK_FIELDS.to_vec()).prop_map(str::to_string),
        field_value_strategy(),
        1..4,
    )
}

/// Strategy for a sequence of offline field edits across `books` books.
pub fn edit_sequence_strategy(
    books: usize,
    max_len: usize,
) -> impl Strategy<Value = Vec<(EntityRef, UpdateFields)>> {
    prop::collection::vec(
        (
            book_ref_strategy(books),
            field_patch_strategy().prop_map(|fields| UpdateFields { fields }),
        ),
        1..max_len.max(2),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn patches_use_book_fields(patch in field_patch_strategy()) {
            prop_assert!(!patch.is_empty());
            for name in patch.keys() {
                prop_assert!(BOOK_FIELDS.contains(&name.as_str()));
            }
        }

        #[test]
        fn ids_are_not_temporary(id in entity_id_strategy()) {
            prop_assert!(!id.is_temporary());
        }
    }
}
