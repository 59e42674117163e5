use std::collections::BTreeSet;

use crate::wire::Stat;

#[derive(Debug, Clone)]
pub struct Znode {
    pub data: Vec<u8>,
    pub acl_id: u64,
    pub stat: Stat,
    pub children: BTreeSet<String>,
}

impl Znode {
    pub fn new(data: Vec<u8>, acl_id: u64, zxid: i64, time_ms: i64, ephemeral_owner: i64) -> Self {
        Znode {
            data: data.clone(),
            acl_id,
            stat: Stat {
                czxid: zxid,
                mzxid: zxid,
                ctime: time_ms,
                mtime: time_ms,
                version: 0,
                cversion: 0,
                aversion: 0,
                ephemeral_owner,
                data_length: data.len() as i32,
                num_children: 0,
                pzxid: zxid,
            },
            children: BTreeSet::new(),
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.stat.ephemeral_owner != 0
    }
}

/// Splits `/a/b/c` into (`/a/b`, `c`). The root `/` has no parent.
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    if path == "/" {
        return None;
    }
    let idx = path.rfind('/')?;
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    let basename = &path[idx + 1..];
    Some((parent, basename))
}

/// Validates a client-supplied path per the znode path grammar: absolute, `/`-separated, no
/// empty segments, no trailing slash (except the root itself).
pub fn validate_path(path: &str) -> bool {
    if path.is_empty() || !path.starts_with('/') {
        return false;
    }
    if path == "/" {
        return true;
    }
    if path.ends_with('/') {
        return false;
    }
    path.split('/').skip(1).all(|segment| !segment.is_empty())
}

pub fn format_sequential(prefix: &str, counter: u64) -> String {
    format!("{}{:010}", prefix, counter)
}
