//! Caller identity and user-namespace id mappings.
//!
//! An unprivileged build maps the caller onto container uid 0 and its
//! subordinate id ranges (`/etc/subuid`, `/etc/subgid`) onto the ids above,
//! so that every in-image id has a host id to land on. The result is
//! computed once per process and only read afterwards.

pub mod reexec;

use std::fs;
use std::path::Path;

use nix::unistd::{Gid, Group, Uid, User};
use serde::{Deserialize, Serialize};

use img_shared::{ImgError, ImgResult};

pub const SUBUID_PATH: &str = "/etc/subuid";
pub const SUBGID_PATH: &str = "/etc/subgid";

/// A block of host ids delegated to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubIdRange {
    pub start: u32,
    pub count: u32,
}

/// One `container_id host_id size` line of a uid or gid map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMap {
    /// Map container id 0 onto a single host id.
    pub fn single(host_id: u32) -> Self {
        Self {
            container_id: 0,
            host_id,
            size: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub uids: Vec<IdMap>,
    pub gids: Vec<IdMap>,
}

impl IdMapping {
    /// Map container root onto the given host ids, nothing else.
    pub fn single(uid: u32, gid: u32) -> Self {
        Self {
            uids: vec![IdMap::single(uid)],
            gids: vec![IdMap::single(gid)],
        }
    }

    /// Host id that container root maps to.
    pub fn root_uid(&self) -> Option<u32> {
        self.uids
            .iter()
            .find(|m| m.container_id == 0)
            .map(|m| m.host_id)
    }
}

/// The invoking user and their subordinate ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub user: String,
    pub group: String,
    pub subuids: Vec<SubIdRange>,
    pub subgids: Vec<SubIdRange>,
}

impl Identity {
    pub fn mapping(&self) -> ImgResult<IdMapping> {
        build_userns_mapping(self.uid, self.gid, &self.subuids, &self.subgids)
    }
}

/// Ranges in a subuid/subgid file that belong to `name` or numeric `id`,
/// sorted by start.
pub fn parse_subid(content: &str, name: &str, id: u32) -> Vec<SubIdRange> {
    let id = id.to_string();
    let mut ranges: Vec<SubIdRange> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut parts = line.split(':');
            let owner = parts.next()?;
            let start = parts.next()?.trim().parse().ok()?;
            let count = parts.next()?.trim().parse().ok()?;
            (owner == name || owner == id).then_some(SubIdRange { start, count })
        })
        .filter(|r| r.count > 0)
        .collect();
    ranges.sort_by_key(|r| r.start);
    ranges
}

/// Resolve the current user against the host's subordinate id files.
pub fn resolve_identity() -> ImgResult<Identity> {
    resolve_identity_from(Path::new(SUBUID_PATH), Path::new(SUBGID_PATH))
}

pub fn resolve_identity_from(subuid: &Path, subgid: &Path) -> ImgResult<Identity> {
    let uid = Uid::current();
    let gid = Gid::current();

    let user = User::from_uid(uid)
        .map_err(|e| ImgError::Identity(format!("getting current user failed: {}", e)))?
        .map(|u| u.name)
        .unwrap_or_else(|| uid.to_string());
    let group = Group::from_gid(gid)
        .map_err(|e| ImgError::Identity(format!("getting current group failed: {}", e)))?
        .map(|g| g.name)
        .unwrap_or_else(|| gid.to_string());

    let subuids = parse_subid(&read_subid_file(subuid)?, &user, uid.as_raw());
    let subgids = parse_subid(&read_subid_file(subgid)?, &group, gid.as_raw());

    tracing::debug!(
        %user,
        %group,
        subuids = subuids.len(),
        subgids = subgids.len(),
        "Resolved identity"
    );

    Ok(Identity {
        uid: uid.as_raw(),
        gid: gid.as_raw(),
        user,
        group,
        subuids,
        subgids,
    })
}

fn read_subid_file(path: &Path) -> ImgResult<String> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(ImgError::Identity(format!(
            "failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Map container id 0 onto the caller's own ids, then lay the subordinate
/// ranges end to end from container id 1.
pub fn build_userns_mapping(
    uid: u32,
    gid: u32,
    uid_ranges: &[SubIdRange],
    gid_ranges: &[SubIdRange],
) -> ImgResult<IdMapping> {
    if uid_ranges.is_empty() {
        return Err(ImgError::Identity(
            "no subordinate uid ranges configured for the current user".into(),
        ));
    }
    if gid_ranges.is_empty() {
        return Err(ImgError::Identity(
            "no subordinate gid ranges configured for the current user".into(),
        ));
    }
    Ok(IdMapping {
        uids: cumulative(uid, uid_ranges)?,
        gids: cumulative(gid, gid_ranges)?,
    })
}

fn cumulative(own: u32, ranges: &[SubIdRange]) -> ImgResult<Vec<IdMap>> {
    let mut next: u32 = 1;
    let mut maps = Vec::with_capacity(ranges.len() + 1);
    maps.push(IdMap::single(own));
    for range in ranges {
        maps.push(IdMap {
            container_id: next,
            host_id: range.start,
            size: range.count,
        });
        next = next.checked_add(range.count).ok_or_else(|| {
            ImgError::Identity("subordinate id ranges exceed the id space".into())
        })?;
    }
    Ok(maps)
}
