use uuid::Uuid;

/// Namespace for all deterministic plant ids.
///
/// Interface and endpoint ids must be reproducible across the schema
/// loader, the endpoints automaton, and the trigger tables, so they are
/// UUID v5 values over a fixed namespace.
const ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0xb0, 0x69, 0xd7, 0x2c, 0x7e, 0x91, 0x4b, 0x0e, 0x92, 0x48, 0x33, 0x17, 0x6c, 0x71, 0x9f,
    0xe5,
]);

/// Deterministic id for `interface_name` at `major`.
pub fn interface_id(interface_name: &str, major: i32) -> Uuid {
    let name = format!("{interface_name}:{major}");
    Uuid::new_v5(&ID_NAMESPACE, name.as_bytes())
}

/// Deterministic id for one endpoint of an interface.
///
/// Object-aggregated interfaces use the empty endpoint string as the id of
/// the whole aggregate.
pub fn endpoint_id(interface_name: &str, major: i32, endpoint: &str) -> Uuid {
    let name = format!("{interface_name}:{major}:{endpoint}");
    Uuid::new_v5(&ID_NAMESPACE, name.as_bytes())
}

/// Map an object-aggregation endpoint leaf name to its storage column.
///
/// Columns are `v_` plus the lowercased leaf with anything outside
/// `[a-z0-9]` folded to `_`.
pub fn endpoint_to_db_column_name(endpoint_leaf: &str) -> String {
    let mut column = String::with_capacity(endpoint_leaf.len() + 2);
    column.push_str("v_");
    for c in endpoint_leaf.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            column.push(c);
        } else {
            column.push('_');
        }
    }
    column
}
