//! ACL entries and the permission bits, as laid out on the wire:
//! `[perms:i32][scheme_len:i32][scheme][id_len:i32][id]`.

use super::frame::{read_i32, read_string, write_i32, write_string, FrameError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permission {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub delete: bool,
    pub admin: bool,
}

impl Permission {
    pub const READ: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    pub const CREATE: u32 = 1 << 2;
    pub const DELETE: u32 = 1 << 3;
    pub const ADMIN: u32 = 1 << 4;
    pub const ALL: u32 = Self::READ | Self::WRITE | Self::CREATE | Self::DELETE | Self::ADMIN;

    pub fn from_bits(bits: i32) -> Self {
        let bits = bits as u32;
        Permission {
            read: bits & Self::READ != 0,
            write: bits & Self::WRITE != 0,
            create: bits & Self::CREATE != 0,
            delete: bits & Self::DELETE != 0,
            admin: bits & Self::ADMIN != 0,
        }
    }

    pub fn bits(self) -> i32 {
        let mut bits = 0u32;
        if self.read {
            bits |= Self::READ;
        }
        if self.write {
            bits |= Self::WRITE;
        }
        if self.create {
            bits |= Self::CREATE;
        }
        if self.delete {
            bits |= Self::DELETE;
        }
        if self.admin {
            bits |= Self::ADMIN;
        }
        bits as i32
    }

    pub fn all() -> Self {
        Self::from_bits(Self::ALL as i32)
    }
}

/// `{scheme, id, perms}`. `scheme` is one of `world`, `auth`, `digest`, `ip`, `super`, matching
/// ZooKeeper's built-in ACL providers. Credentials offered via the `auth` op are recorded
/// verbatim in the session's auth table (`crate::keeper::session::Session::auth_ids`) but are
/// never verified against anything, and no operation consults them to gate access — every ACL in
/// this type is carried and interned, never enforced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Acl {
    pub scheme: String,
    pub id: String,
    pub perms: PermBits,
}

/// Permission bits stored verbatim so `Acl` can implement `Eq`/`Hash` for ACL-list interning.
pub type PermBits = i32;

impl Acl {
    pub fn decode(cursor: &mut &[u8]) -> Result<Self, FrameError> {
        let perms = read_i32(cursor)?;
        let scheme = read_string(cursor)?;
        let id = read_string(cursor)?;
        Ok(Acl { scheme, id, perms })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_i32(buf, self.perms);
        write_string(buf, &self.scheme);
        write_string(buf, &self.id);
    }

    pub fn permission(&self) -> Permission {
        Permission::from_bits(self.perms)
    }
}

pub fn decode_acl_list(cursor: &mut &[u8]) -> Result<Vec<Acl>, FrameError> {
    let count = read_i32(cursor)?;
    if count < 0 {
        return Err(FrameError::Truncated);
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(Acl::decode(cursor)?);
    }
    Ok(out)
}

pub fn encode_acl_list(buf: &mut Vec<u8>, acls: &[Acl]) {
    write_i32(buf, acls.len() as i32);
    for acl in acls {
        acl.encode(buf);
    }
}

/// The well-known `world:anyone` ACL granting every permission, used as the default when a
/// `create` request supplies an empty ACL list.
pub fn open_acl_unsafe() -> Vec<Acl> {
    vec![Acl {
        scheme: "world".to_string(),
        id: "anyone".to_string(),
        perms: Permission::ALL as i32,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_bits_round_trip() {
        let perm = Permission {
            read: true,
            write: false,
            create: true,
            delete: false,
            admin: true,
        };
        assert_eq!(Permission::from_bits(perm.bits()), perm);
    }

    #[test]
    fn permission_all_sets_every_bit() {
        let perm = Permission::all();
        assert!(perm.read && perm.write && perm.create && perm.delete && perm.admin);
    }

    #[test]
    fn acl_list_round_trips() {
        let acls = vec![
            Acl {
                scheme: "digest".to_string(),
                id: "user:hash".to_string(),
                perms: Permission::READ as i32 | Permission::WRITE as i32,
            },
            open_acl_unsafe().remove(0),
        ];
        let mut buf = Vec::new();
        encode_acl_list(&mut buf, &acls);
        let mut cursor = &buf[..];
        let decoded = decode_acl_list(&mut cursor).unwrap();
        assert_eq!(decoded, acls);
        assert!(cursor.is_empty());
    }

    #[test]
    fn empty_acl_list_round_trips() {
        let mut buf = Vec::new();
        encode_acl_list(&mut buf, &[]);
        let mut cursor = &buf[..];
        assert!(decode_acl_list(&mut cursor).unwrap().is_empty());
    }

    #[test]
    fn open_acl_unsafe_grants_all_permissions() {
        let acl = &open_acl_unsafe()[0];
        assert_eq!(acl.scheme, "world");
        assert_eq!(acl.id, "anyone");
        assert!(acl.permission().admin);
    }

    #[test]
    fn negative_acl_count_is_rejected() {
        let mut buf = Vec::new();
        write_i32(&mut buf, -1);
        let mut cursor = &buf[..];
        assert!(matches!(decode_acl_list(&mut cursor), Err(FrameError::Truncated)));
    }
}
