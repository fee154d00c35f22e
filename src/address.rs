//! Deterministic rewrite of an upstream address into a downstream one (§6.2).

use thiserror::Error;

/// The input address did not have at least `endpoint` and `tenant` segments.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("address {0:?} has fewer than two path segments")]
pub struct AddressError(pub String);

/// Rewrite `endpoint/tenant[/deviceId]` into `<endpoint><sep><tenant>`.
///
/// Any device-id component is discarded. `/` in the result is then replaced
/// with `path_separator` (this only matters when `path_separator != '/'`,
/// since `endpoint`/`tenant` themselves cannot contain further `/`).
pub fn rewrite_address(input: &str, path_separator: char) -> Result<String, AddressError> {
    let mut segments = input.split('/');
    let endpoint = segments.next().filter(|s| !s.is_empty());
    let tenant = segments.next().filter(|s| !s.is_empty());

    match (endpoint, tenant) {
        (Some(endpoint), Some(tenant)) => {
            let joined = format!("{endpoint}/{tenant}");
            Ok(joined.replace('/', &path_separator.to_string()))
        }
        _ => Err(AddressError(input.to_string())),
    }
}
