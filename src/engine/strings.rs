//! String handle resolution and remote naming helpers

use super::status::{RemoteResultExt, Step};
use super::{RemoteEngine, SessionHandle, StringHandle};
use crate::error::Result;
use std::collections::HashMap;

/// Resolve a set of handles with a single remote call.
///
/// Duplicates and null handles are not sent. Null handles resolve to an empty
/// string in the returned map.
pub fn resolve_batch(
    engine: &dyn RemoteEngine,
    session: &SessionHandle,
    handles: &[StringHandle],
) -> Result<HashMap<StringHandle, String>> {
    let mut unique: Vec<StringHandle> = handles.iter().copied().filter(|h| !h.is_null()).collect();
    unique.sort();
    unique.dedup();

    let mut resolved = HashMap::with_capacity(unique.len() + 1);
    resolved.insert(StringHandle::NULL, String::new());
    if unique.is_empty() {
        return Ok(resolved);
    }

    let texts = engine.resolve_strings(session, &unique).step(Step::ResolveStrings)?;
    for (handle, text) in unique.into_iter().zip(texts) {
        resolved.insert(handle, text);
    }
    Ok(resolved)
}

/// Resolve handles and return the texts in input order
pub fn resolve_ordered(
    engine: &dyn RemoteEngine,
    session: &SessionHandle,
    handles: &[StringHandle],
) -> Result<Vec<String>> {
    let map = resolve_batch(engine, session, handles)?;
    Ok(handles
        .iter()
        .map(|h| map.get(h).cloned().unwrap_or_default())
        .collect())
}

/// Whether `c` is allowed in remote node names
#[inline]
pub fn is_valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Replace every character the engine rejects with `_`
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if is_valid_name_char(c) { c } else { '_' })
        .collect()
}

/// 8-digit uppercase hex identifier derived from a stable key (FNV-1a)
pub fn identifier(key: u32) -> String {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key.to_le_bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    format!("{:08X}", hash)
}

/// Deterministic remote node name for an operator instantiated by `key`
pub fn remote_node_name(operator: &str, key: u32) -> String {
    format!("{}_{}", sanitize_name(operator), identifier(key))
}
