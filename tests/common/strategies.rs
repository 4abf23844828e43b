use proptest::prelude::*;

/// Names accepted for queues, topics, subscribers and sagas
pub fn valid_name_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9_.]{1,40}"
}

/// Names containing at least one character outside `[a-z0-9_.]`
pub fn invalid_character_name_strategy() -> impl Strategy<Value = String> {
    ("[a-z]{0,10}", "[A-Z\\-/ #@!]", "[a-z]{0,10}")
        .prop_map(|(prefix, bad, suffix)| format!("{prefix}{bad}{suffix}"))
}

/// Whitespace-only input
pub fn blank_name_strategy() -> impl Strategy<Value = String> {
    "[ \t\n]{0,8}"
}

/// Ordered user headers with unique names
pub fn user_headers_strategy() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::btree_map("[a-z][a-z0-9\\-]{0,15}", ".{0,32}", 0..8)
        .prop_map(|headers| headers.into_iter().collect())
}

pub fn trace_parent_strategy() -> impl Strategy<Value = Option<String>> {
    prop::option::of("00-[0-9a-f]{32}-[0-9a-f]{16}-01")
}

/// Saga keys within the accepted length
pub fn saga_key_strategy() -> impl Strategy<Value = String> {
    ".{1,100}"
}
