//! UID/GID drift between the accounts of two layers.
//!
//! After `/etc` was carried over from the previous layer, accounts that only the new image knows
//! about may collide with local ones, and accounts both know may carry different ids. The merged
//! databases keep every id of the previous layer; files of the new tree are re-owned to match.

use std::{
    collections::{BTreeSet, HashMap},
    os::unix::fs::{MetadataExt as _, PermissionsExt as _},
    path::Path,
};

use anyhow::{Context as _, Result};
use async_walkdir::WalkDir;
use futures::StreamExt as _;

use crate::{error::Error, runner::Runner};

/// Ids below this are system accounts and stay below it when moved.
const SYSTEM_ID_LIMIT: u32 = 1000;

/// The column holding the numeric id, the same for `passwd` and `group`.
const ID_FIELD: usize = 2;
/// The primary group column of `passwd`.
const GID_FIELD: usize = 3;

/// A colon separated account database such as `passwd` or `group`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdDatabase {
    entries: Vec<Vec<String>>,
}

impl IdDatabase {
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
            .map(|line| line.split(':').map(ToOwned::to_owned).collect::<Vec<_>>())
            .filter(|fields| fields.len() > ID_FIELD)
            .collect();
        Self { entries }
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|fields| format!("{}\n", fields.join(":")))
            .collect()
    }

    fn id(fields: &[String]) -> Option<u32> {
        fields.get(ID_FIELD)?.parse().ok()
    }

    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|fields| fields[0] == name)
            .and_then(|fields| Self::id(fields))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|fields| fields[0].as_str())
    }

    fn ids(&self) -> BTreeSet<u32> {
        self.entries.iter().filter_map(|f| Self::id(f)).collect()
    }
}

/// The first id at or after `start` not in `used`. System ids wrap around below 1000.
fn free_id(used: &BTreeSet<u32>, start: u32) -> Option<u32> {
    if start < SYSTEM_ID_LIMIT {
        (start..SYSTEM_ID_LIMIT)
            .chain(1..start)
            .find(|id| !used.contains(id))
    } else {
        (start..=u32::MAX).find(|id| !used.contains(id))
    }
}

/// Merge `new` into `prev`. Returns the merged database, the names taken from `new` and the
/// mapping from ids used in the new tree to the ids they have to become.
fn merge(
    prev: &IdDatabase,
    new: &IdDatabase,
    kind: &str,
) -> Result<(IdDatabase, Vec<String>, HashMap<u32, u32>)> {
    let mut merged = prev.clone();
    let mut used = prev.ids();
    let mut added = vec![];
    let mut moved = HashMap::new();

    for fields in &new.entries {
        let (name, Some(id)) = (&fields[0], IdDatabase::id(fields)) else {
            continue;
        };
        if let Some(prev_id) = prev.id_of(name) {
            if prev_id != id {
                tracing::info!("{kind} {name} keeps id {prev_id} instead of {id}");
                moved.insert(id, prev_id);
            }
            continue;
        }

        let final_id = if used.contains(&id) {
            let free = free_id(&used, id).ok_or_else(|| {
                Error::MigrationFailed(format!("no free {kind} id left for {name}"))
            })?;
            tracing::info!("{kind} {name} moves from id {id} to {free}");
            moved.insert(id, free);
            free
        } else {
            id
        };
        used.insert(final_id);

        let mut fields = fields.clone();
        fields[ID_FIELD] = final_id.to_string();
        merged.entries.push(fields);
        added.push(name.clone());
    }
    Ok((merged, added, moved))
}

/// Account databases of both layers, read before `/etc` of the new layer gets overwritten.
#[derive(Debug, Clone, Default)]
pub struct Accounts {
    pub passwd: String,
    pub group: String,
    pub shadow: String,
    pub gshadow: String,
}

impl Accounts {
    pub async fn read(root: impl AsRef<Path>) -> Result<Self> {
        let etc = root.as_ref().join("etc");
        let read = |name: &str| {
            let path = etc.join(name);
            async move {
                Ok::<_, anyhow::Error>(crate::fs::read_optional(&path).await?.unwrap_or_default())
            }
        };
        Ok(Self {
            passwd: read("passwd").await?,
            group: read("group").await?,
            shadow: read("shadow").await?,
            gshadow: read("gshadow").await?,
        })
    }
}

/// Result of merging the accounts of two layers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub passwd: String,
    pub group: String,
    pub shadow: String,
    pub gshadow: String,
    pub uid_map: HashMap<u32, u32>,
    pub gid_map: HashMap<u32, u32>,
}

/// Lines of `new` for `names` missing from `prev`, appended to `prev`.
fn append_missing(prev: &str, new: &str, names: &[String]) -> String {
    let mut out = prev.to_owned();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    for line in new.lines() {
        let name = line.split(':').next().unwrap_or_default();
        let known = prev.lines().any(|l| l.split(':').next() == Some(name));
        if names.iter().any(|n| n == name) && !known {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

pub fn reconcile(prev: &Accounts, new: &Accounts) -> Result<Reconciled> {
    let (group, added_groups, gid_map) = merge(
        &IdDatabase::parse(&prev.group),
        &IdDatabase::parse(&new.group),
        "group",
    )?;
    let (mut passwd, added_users, uid_map) = merge(
        &IdDatabase::parse(&prev.passwd),
        &IdDatabase::parse(&new.passwd),
        "user",
    )?;

    // primary groups of users taken from the new image follow their group
    for fields in passwd.entries.iter_mut() {
        if !added_users.contains(&fields[0]) {
            continue;
        }
        if let Some(gid) = fields.get(GID_FIELD).and_then(|g| g.parse::<u32>().ok()) {
            if let Some(moved) = gid_map.get(&gid) {
                fields[GID_FIELD] = moved.to_string();
            }
        }
    }

    Ok(Reconciled {
        passwd: passwd.render(),
        group: group.render(),
        shadow: append_missing(&prev.shadow, &new.shadow, &added_users),
        gshadow: append_missing(&prev.gshadow, &new.gshadow, &added_groups),
        uid_map,
        gid_map,
    })
}

/// Re-own every file under `root` whose uid or gid was moved. setuid and setgid bits, which
/// `chown` drops, are put back. Returns the number of changed files.
pub async fn restore_ownership(
    runner: &Runner,
    root: &Path,
    uid_map: &HashMap<u32, u32>,
    gid_map: &HashMap<u32, u32>,
) -> Result<usize> {
    if uid_map.is_empty() && gid_map.is_empty() {
        return Ok(0);
    }
    if runner.is_dry_run() {
        tracing::info!("(dry-run) re-own files under {root:?}");
        return Ok(0);
    }

    let mut changed = 0;
    let mut entries = WalkDir::new(root);
    while let Some(entry) = entries.next().await {
        let path = entry.context("Failed to walk the new layer")?.path();
        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .with_context(|| format!("Failed to stat {path:?}"))?;
        let (uid, gid) = (meta.uid(), meta.gid());
        let new_uid = uid_map.get(&uid).copied().unwrap_or(uid);
        let new_gid = gid_map.get(&gid).copied().unwrap_or(gid);
        if (new_uid, new_gid) == (uid, gid) {
            continue;
        }

        std::os::unix::fs::lchown(&path, Some(new_uid), Some(new_gid))
            .with_context(|| format!("Failed to change the owner of {path:?}"))?;
        if !meta.file_type().is_symlink() && meta.mode() & 0o6000 != 0 {
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(meta.mode() & 0o7777))
                .await
                .with_context(|| format!("Failed to restore the mode of {path:?}"))?;
        }
        changed += 1;
    }
    tracing::info!("Re-owned {changed} files under {root:?}");
    Ok(changed)
}
