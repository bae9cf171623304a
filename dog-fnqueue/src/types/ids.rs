use rand::Rng;
use ulid::Ulid;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Stable, compact hash of an identifier: the first eight bytes of its
/// blake3 digest, little-endian, written in base36.
pub fn hash_id(id: &str) -> String {
    let digest = blake3::hash(id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    base36(u64::from_le_bytes(bytes))
}

fn base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::with_capacity(13);
    while n > 0 {
        out.push(BASE36[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// A time-ordered id whose timestamp is `at_ms`.
pub fn ulid_at(at_ms: i64) -> Ulid {
    Ulid::from_parts(at_ms.max(0) as u64, rand::thread_rng().gen())
}

/// New lease id; the embedded timestamp is the lease expiry.
pub fn new_lease_id(expires_at_ms: i64) -> Ulid {
    ulid_at(expires_at_ms)
}

/// Expiry of a lease id in unix milliseconds.
pub fn lease_expiry_ms(lease_id: &Ulid) -> i64 {
    i64::try_from(lease_id.timestamp_ms()).unwrap_or(i64::MAX)
}

/// Whether a lease id is still valid at `now_ms`.
pub fn is_lease_valid(lease_id: &Ulid, now_ms: i64) -> bool {
    lease_expiry_ms(lease_id) > now_ms
}
