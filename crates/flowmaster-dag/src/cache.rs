// Copyright (C) 2025 Flowmaster Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deterministic cache-key derivation and parsing.
//!
//! The cache key fingerprints a task's effective inputs: task code,
//! definition version, environment configuration, the resolved values of
//! every parameter the script actually references, and the checksum of
//! every declared input file. Identical inputs always yield an identical
//! key; a change to any referenced value yields a different key.
//! Parameters the script never references are excluded, so adding an
//! unrelated variable does not invalidate the cache.

use crate::model::TaskParam;
use sha2::{Digest, Sha256};

/// Effective inputs hashed into a cache key.
#[derive(Debug, Clone)]
pub struct CacheKeyInput<'a> {
    /// Task definition code.
    pub task_code: i64,
    /// Task definition version.
    pub task_version: i32,
    /// Environment configuration text, if any.
    pub environment_config: Option<&'a str>,
    /// The resolved script/command the worker will execute.
    pub script: &'a str,
    /// Fully resolved parameters (after merging, see [`merge_params`]).
    pub params: &'a [TaskParam],
    /// `(name, checksum)` for every declared input file. Always part of
    /// the key: a changed file invalidates the cache even when the
    /// filename parameter is unchanged.
    pub file_checksums: &'a [(String, String)],
}

/// Merge parameter layers into the resolved set used for dispatch and
/// cache-key derivation. Later layers override earlier ones:
/// fixed definition params, then trigger/context params, then the
/// variable pool propagated from upstream tasks.
pub fn merge_params(
    fixed: &[TaskParam],
    context: &[TaskParam],
    var_pool: &[TaskParam],
) -> Vec<TaskParam> {
    let mut merged: Vec<TaskParam> = Vec::new();
    for layer in [fixed, context, var_pool] {
        for param in layer {
            match merged.iter_mut().find(|p| p.prop == param.prop) {
                Some(existing) => existing.value = param.value.clone(),
                None => merged.push(param.clone()),
            }
        }
    }
    merged
}

/// Whether the script references a parameter by name (`${prop}`).
fn script_references(script: &str, prop: &str) -> bool {
    script.contains(&format!("${{{prop}}}"))
}

/// Generate the cache key: SHA-256 hex over a canonical rendering of the
/// effective inputs. Only parameters the script references contribute.
pub fn generate_cache_key(input: &CacheKeyInput<'_>) -> String {
    let mut referenced: Vec<&TaskParam> = input
        .params
        .iter()
        .filter(|p| script_references(input.script, &p.prop))
        .collect();
    referenced.sort_by(|a, b| a.prop.cmp(&b.prop));

    let mut files: Vec<&(String, String)> = input.file_checksums.iter().collect();
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut canonical = String::new();
    canonical.push_str(&format!("code:{}\n", input.task_code));
    canonical.push_str(&format!("version:{}\n", input.task_version));
    canonical.push_str(&format!(
        "env:{}\n",
        input.environment_config.unwrap_or_default()
    ));
    for param in referenced {
        canonical.push_str(&format!("param:{}={}\n", param.prop, param.value));
    }
    for (name, checksum) in files {
        canonical.push_str(&format!("file:{name}={checksum}\n"));
    }

    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Tag a cache key with the task instance that produced the cached
/// result: `"{source_task_instance_id}-{key}"`.
pub fn tag_cache_key(source_task_instance_id: i64, key: &str) -> String {
    format!("{source_task_instance_id}-{key}")
}

/// Parse a possibly-tagged cache key back into
/// `(source_task_instance_id, key)`.
///
/// - `None` or malformed input (more than one separator, or an
///   unparsable id) yields `(-1, "")`;
/// - an untagged key yields `(-1, key)`;
/// - `"{id}-{key}"` yields `(id, key)`.
pub fn revert_cache_key(tagged: Option<&str>) -> (i64, String) {
    let Some(tagged) = tagged else {
        return (-1, String::new());
    };
    let parts: Vec<&str> = tagged.split('-').collect();
    match parts.as_slice() {
        [key] => (-1, (*key).to_string()),
        [id, key] => match id.parse::<i64>() {
            Ok(id) => (id, (*key).to_string()),
            Err(_) => (-1, String::new()),
        },
        _ => (-1, String::new()),
    }
}
