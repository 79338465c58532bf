//! Resource-version ordering.

/// Returns true when `new_rv` is strictly newer than `old_rv`.
///
/// Equal-length versions compare lexicographically, which is both cheap and
/// correct for zero-free monotonic counters. Different lengths fall back to a
/// numeric parse; a non-numeric old token counts as older, a non-numeric new
/// token as not newer.
pub fn newer(old_rv: &str, new_rv: &str) -> bool {
    if old_rv.len() == new_rv.len() {
        return old_rv < new_rv;
    }
    let old: u64 = match old_rv.parse() {
        Ok(v) => v,
        Err(_) => return true,
    };
    let new: u64 = match new_rv.parse() {
        Ok(v) => v,
        Err(_) => return false,
    };
    old < new
}
