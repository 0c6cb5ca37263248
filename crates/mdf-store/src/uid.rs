//! Upload identifiers.

use uuid::Uuid;

/// A fresh upload ID: a random (v4) UUID as 32 lowercase hex characters,
/// 122 of its 128 bits random.
pub fn generate() -> String {
    Uuid::new_v4().simple().to_string()
}
