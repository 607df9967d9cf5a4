//! Cache key derivation.

use sha2::{Digest, Sha256};

/// Return a stable cache key for `vin` and an optional endpoint set.
///
/// * No endpoints → `"{vin}_all"`
/// * With endpoints → `"{vin}_{sha256(sorted ';'-joined)[..12]}"`
///
/// Sorting makes the key order-independent: `["a","b"]` and `["b","a"]`
/// produce the same key.
pub fn cache_key(vin: &str, endpoints: Option<&[String]>) -> String {
    match endpoints {
        None => format!("{vin}_all"),
        Some(eps) if eps.is_empty() => format!("{vin}_all"),
        Some(eps) => {
            let mut sorted: Vec<&str> = eps.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            let joined = sorted.join(";");
            let digest = Sha256::digest(joined.as_bytes());
            let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
            format!("{vin}_{}", &hex[..12])
        }
    }
}
