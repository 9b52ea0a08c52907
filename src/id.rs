use ulid::Ulid;

pub fn new_request_id() -> String {
    Ulid::new().to_string()
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Transactions share the request's ULID under a `tx_` prefix so either id leads to the other.
pub fn transaction_id_for(request_id: &str) -> String {
    format!("tx_{request_id}")
}

pub fn is_ulid_string(s: &str) -> bool {
    Ulid::from_string(s).is_ok()
}
