use std::collections::HashMap;

use crate::wire::acl::{open_acl_unsafe, Acl};

/// Interns `Vec<Acl>` lists to small integer handles, reference-counted so many nodes can share
/// one entry. Copy-on-write with respect to snapshotting: a snapshot just clones the map's
/// `Arc`-free plain data (it is small; see SPEC_FULL.md §3.4/§5).
#[derive(Debug, Clone)]
pub struct AclMap {
    by_id: HashMap<u64, (Vec<Acl>, u64)>,
    next_id: u64,
    pub open_acl_unsafe_id: u64,
}

impl AclMap {
    pub fn new() -> Self {
        let mut map = AclMap {
            by_id: HashMap::new(),
            next_id: 1,
            open_acl_unsafe_id: 0,
        };
        let id = map.intern(open_acl_unsafe());
        map.open_acl_unsafe_id = id;
        map
    }

    pub fn intern(&mut self, acl: Vec<Acl>) -> u64 {
        if let Some((id, _)) = self
            .by_id
            .iter()
            .find(|(_, (existing, _))| existing == &acl)
        {
            let id = *id;
            self.by_id.get_mut(&id).unwrap().1 += 1;
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_id.insert(id, (acl, 1));
        id
    }

    pub fn release(&mut self, id: u64) {
        if let Some((_, refcount)) = self.by_id.get_mut(&id) {
            *refcount -= 1;
            if *refcount == 0 {
                self.by_id.remove(&id);
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<&Vec<Acl>> {
        self.by_id.get(&id).map(|(acl, _)| acl)
    }

    pub fn entries(&self) -> impl Iterator<Item = (u64, &Vec<Acl>, u64)> {
        self.by_id.iter().map(|(id, (acl, rc))| (*id, acl, *rc))
    }

    pub fn insert_with_refcount(&mut self, id: u64, acl: Vec<Acl>, refcount: u64) {
        self.by_id.insert(id, (acl, refcount));
        self.next_id = self.next_id.max(id + 1);
    }
}

impl Default for AclMap {
    fn default() -> Self {
        Self::new()
    }
}
