//! Resolve a step's `user` string against the rootfs user database.

use std::fs;
use std::io;
use std::path::Path;

use img_shared::{ImgError, ImgResult};

use super::path::root_path;

/// Resolved process identity inside the container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecUser {
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
}

struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
}

struct GroupEntry {
    name: String,
    gid: u32,
    members: Vec<String>,
}

/// Resolve `user` (`""`, `name`, `uid`, and any of those followed by
/// `:group` or `:gid`) using `/etc/passwd` and `/etc/group` under `rootfs`.
///
/// A numeric uid with no passwd entry resolves to gid 0. Names that do not
/// exist are an error.
pub fn resolve_user(rootfs: &Path, user: &str) -> ImgResult<ExecUser> {
    let user = user.trim();
    if user.is_empty() {
        return Ok(ExecUser::default());
    }

    let (user_part, group_part) = match user.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (user, None),
    };

    let passwd = read_passwd(rootfs)?;
    let groups = read_groups(rootfs)?;

    let (uid, mut gid, name) = match user_part.parse::<u32>() {
        Ok(uid) => match passwd.iter().find(|p| p.uid == uid) {
            Some(entry) => (uid, entry.gid, Some(entry.name.clone())),
            None => (uid, 0, None),
        },
        Err(_) => {
            let entry = passwd
                .iter()
                .find(|p| p.name == user_part)
                .ok_or_else(|| {
                    ImgError::SpecBuild(format!(
                        "unable to find user {}: no matching entries in passwd file",
                        user_part
                    ))
                })?;
            (entry.uid, entry.gid, Some(entry.name.clone()))
        }
    };

    let explicit_group = group_part.filter(|g| !g.is_empty());
    if let Some(group) = explicit_group {
        gid = match group.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => {
                groups
                    .iter()
                    .find(|g| g.name == group)
                    .ok_or_else(|| {
                        ImgError::SpecBuild(format!(
                            "unable to find group {}: no matching entries in group file",
                            group
                        ))
                    })?
                    .gid
            }
        };
    }

    // Supplementary groups only apply when the group was not forced.
    let mut additional_gids = Vec::new();
    if explicit_group.is_none()
        && let Some(name) = &name
    {
        for group in &groups {
            if group.gid != gid
                && group.members.iter().any(|m| m == name)
                && !additional_gids.contains(&group.gid)
            {
                additional_gids.push(group.gid);
            }
        }
    }

    Ok(ExecUser {
        uid,
        gid,
        additional_gids,
    })
}

fn read_db(rootfs: &Path, file: &str) -> ImgResult<String> {
    let path = root_path(rootfs, file)
        .map_err(|e| ImgError::SpecBuild(format!("resolving {} failed: {}", file, e)))?;
    match fs::read_to_string(&path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(ImgError::SpecBuild(format!(
            "failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

fn read_passwd(rootfs: &Path) -> ImgResult<Vec<PasswdEntry>> {
    let content = read_db(rootfs, "/etc/passwd")?;
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 4 {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
            })
        })
        .collect())
}

fn read_groups(rootfs: &Path) -> ImgResult<Vec<GroupEntry>> {
    let content = read_db(rootfs, "/etc/group")?;
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 3 {
                return None;
            }
            Some(GroupEntry {
                name: fields[0].to_string(),
                gid: fields[2].parse().ok()?,
                members: fields
                    .get(3)
                    .map(|m| {
                        m.split(',')
                            .map(str::trim)
                            .filter(|m| !m.is_empty())
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default(),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rootfs() -> TempDir {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("etc")).unwrap();
        fs::write(
            root.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\napp:x:1000:1001::/home/app:/bin/sh\n",
        )
        .unwrap();
        fs::write(
            root.path().join("etc/group"),
            "root:x:0:\nstaff:x:50:app\napp:x:1001:\n",
        )
        .unwrap();
        root
    }

    fn user(uid: u32, gid: u32, additional: &[u32]) -> ExecUser {
        ExecUser {
            uid,
            gid,
            additional_gids: additional.to_vec(),
        }
    }

    #[test]
    fn test_empty_is_root() {
        let root = rootfs();
        assert_eq!(resolve_user(root.path(), "").unwrap(), user(0, 0, &[]));
    }

    #[test]
    fn test_name_and_uid() {
        let root = rootfs();
        assert_eq!(resolve_user(root.path(), "app").unwrap(), user(1000, 1001, &[50]));
        assert_eq!(resolve_user(root.path(), "1000").unwrap(), user(1000, 1001, &[50]));
        assert_eq!(resolve_user(root.path(), "4242").unwrap(), user(4242, 0, &[]));
    }

    #[test]
    fn test_with_group() {
        let root = rootfs();
        assert_eq!(resolve_user(root.path(), "app:staff").unwrap(), user(1000, 50, &[]));
        assert_eq!(resolve_user(root.path(), "app:7").unwrap(), user(1000, 7, &[]));
        assert_eq!(resolve_user(root.path(), "1000:1000").unwrap(), user(1000, 1000, &[]));
        assert_eq!(resolve_user(root.path(), "1000:staff").unwrap(), user(1000, 50, &[]));
    }

    #[test]
    fn test_unknown_names_fail() {
        let root = rootfs();
        assert!(matches!(
            resolve_user(root.path(), "nobody"),
            Err(ImgError::SpecBuild(_))
        ));
        assert!(matches!(
            resolve_user(root.path(), "app:wheel"),
            Err(ImgError::SpecBuild(_))
        ));
    }

    #[test]
    fn test_missing_database() {
        let root = TempDir::new().unwrap();
        assert_eq!(resolve_user(root.path(), "12:34").unwrap(), user(12, 34, &[]));
        assert!(resolve_user(root.path(), "app").is_err());
    }
}
