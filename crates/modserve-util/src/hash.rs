/// Build a strong HTTP entity tag for a response body.
///
/// The tag is the first 16 hex digits of the BLAKE3 digest plus the body
/// length, quoted as RFC 9110 requires. Two bodies with the same tag are
/// byte-identical for all practical purposes.
#[must_use]
pub fn etag(data: &[u8]) -> String {
    let digest = blake3::hash(data).to_hex();
    format!("\"{}-{:x}\"", &digest.as_str()[..16], data.len())
}
