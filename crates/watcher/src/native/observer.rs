//! Filesystem observer feeding the emulated service
//!
//! Translates `notify` events into native-style flag sets. The item kind
//! comes from the notification when it carries one, otherwise from the
//! filesystem, otherwise from what was last seen at that path.

use super::emulated::Shared;
use dashmap::DashMap;
use fsevents_core::{Error, EventFlags, Result};
use notify::event::{CreateKind, MetadataKind, ModifyKind, RemoveKind, RenameMode};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Weak;
use tracing::{debug, warn};

/// Recorded on the observed root when notifications were lost
const RESCAN: EventFlags = EventFlags::MUST_SCAN_SUB_DIRS.union(EventFlags::USER_DROPPED);

/// Last known item kind per path
pub(super) type KindCache = DashMap<PathBuf, EventFlags>;

pub(super) struct Observer {
    _watcher: RecommendedWatcher,
}

impl Observer {
    pub(super) fn spawn(root: &Path, shared: Weak<Shared>) -> Result<Self> {
        let watched = root.to_path_buf();
        let kinds = KindCache::new();

        let mut watcher = recommended_watcher(move |result: notify::Result<Event>| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            match result {
                Ok(event) if event.need_rescan() => {
                    debug!(root = %watched.display(), "Observer asked for a rescan");
                    shared.record(watched.clone(), RESCAN);
                }
                Ok(event) => {
                    for (path, flags) in translate(&event, &kinds) {
                        shared.record(path, flags);
                    }
                }
                Err(error) => {
                    warn!(root = %watched.display(), "Observer error: {}", error);
                    shared.record(watched.clone(), RESCAN);
                }
            }
        })
        .map_err(|error| {
            Error::Subscription(format!("failed to create observer for {}: {error}", root.display()))
        })?;

        watcher.watch(root, RecursiveMode::Recursive).map_err(|error| {
            Error::Subscription(format!("failed to observe {}: {error}", root.display()))
        })?;

        debug!(root = %root.display(), "Observer attached");
        Ok(Self { _watcher: watcher })
    }
}

/// Flag set for each path named by `event`
pub(super) fn translate(event: &Event, kinds: &KindCache) -> Vec<(PathBuf, EventFlags)> {
    let action = match event.kind {
        EventKind::Access(_) | EventKind::Other => return Vec::new(),
        EventKind::Create(_) => EventFlags::ITEM_CREATED,
        EventKind::Remove(_) => EventFlags::ITEM_REMOVED,
        EventKind::Modify(ModifyKind::Data(_)) => EventFlags::ITEM_MODIFIED,
        EventKind::Modify(ModifyKind::Name(_)) => EventFlags::ITEM_RENAMED,
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Ownership)) => {
            EventFlags::ITEM_CHANGE_OWNER
        }
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Extended)) => {
            EventFlags::ITEM_XATTR_MOD
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => EventFlags::ITEM_INODE_META_MOD,
        EventKind::Modify(_) | EventKind::Any => EventFlags::ITEM_MODIFIED,
    };

    event
        .paths
        .iter()
        .enumerate()
        .map(|(index, path)| {
            let kind = if leaves(&event.kind, index) {
                forget_kind(&event.kind, path, kinds)
            } else {
                item_kind(&event.kind, path, kinds)
            };
            (path.clone(), action | kind)
        })
        .collect()
}

/// Whether the `index`th path of an event no longer names the item
fn leaves(kind: &EventKind, index: usize) -> bool {
    match kind {
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => true,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => index == 0,
        _ => false,
    }
}

/// Kind of an item that left `path`; drops what the cache held for it and,
/// for a directory, for everything below it
fn forget_kind(kind: &EventKind, path: &Path, kinds: &KindCache) -> EventFlags {
    let cached = kinds.remove(path).map(|(_, flags)| flags);
    let kind = match hint(kind) {
        hinted if hinted.is_empty() => cached.unwrap_or(EventFlags::empty()),
        hinted => hinted,
    };
    if kind.contains(EventFlags::ITEM_IS_DIR) {
        kinds.retain(|held, _| !held.starts_with(path));
    }
    kind
}

fn hint(kind: &EventKind) -> EventFlags {
    match kind {
        EventKind::Create(CreateKind::File) | EventKind::Remove(RemoveKind::File) => {
            EventFlags::ITEM_IS_FILE
        }
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => {
            EventFlags::ITEM_IS_DIR
        }
        _ => EventFlags::empty(),
    }
}

fn item_kind(kind: &EventKind, path: &Path, kinds: &KindCache) -> EventFlags {
    let hinted = hint(kind);
    let kind = if hinted.is_empty() {
        kind_on_disk(path)
            .or_else(|| kinds.get(path).map(|entry| *entry.value()))
            .unwrap_or(EventFlags::empty())
    } else {
        hinted
    };
    if !kind.is_empty() {
        kinds.insert(path.to_path_buf(), kind);
    }
    kind
}

fn kind_on_disk(path: &Path) -> Option<EventFlags> {
    let file_type = std::fs::symlink_metadata(path).ok()?.file_type();
    Some(if file_type.is_symlink() {
        EventFlags::ITEM_IS_SYMLINK
    } else if file_type.is_dir() {
        EventFlags::ITEM_IS_DIR
    } else {
        EventFlags::ITEM_IS_FILE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::DataChange;
    use tempfile::TempDir;

    fn event(kind: EventKind, path: &Path) -> Event {
        Event::new(kind).add_path(path.to_path_buf())
    }

    #[test]
    fn test_translate_create_modify_remove() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.txt");
        std::fs::write(&file, b"x").unwrap();
        let kinds = KindCache::new();

        let created = translate(&event(EventKind::Create(CreateKind::Any), &file), &kinds);
        assert_eq!(created, vec![(file.clone(), EventFlags::ITEM_CREATED | EventFlags::ITEM_IS_FILE)]);

        let modified = translate(
            &event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), &file),
            &kinds,
        );
        assert_eq!(modified[0].1, EventFlags::ITEM_MODIFIED | EventFlags::ITEM_IS_FILE);

        // Gone from disk: the kind comes from the cache
        std::fs::remove_file(&file).unwrap();
        let removed = translate(&event(EventKind::Remove(RemoveKind::Any), &file), &kinds);
        assert_eq!(removed[0].1, EventFlags::ITEM_REMOVED | EventFlags::ITEM_IS_FILE);
        assert!(kinds.get(&file).is_none());
    }

    #[test]
    fn test_translate_directory_and_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("sub");
        std::fs::create_dir(&dir).unwrap();
        let kinds = KindCache::new();

        let created = translate(&event(EventKind::Create(CreateKind::Folder), &dir), &kinds);
        assert_eq!(created[0].1, EventFlags::ITEM_CREATED | EventFlags::ITEM_IS_DIR);

        let owner = translate(
            &event(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Ownership)), &dir),
            &kinds,
        );
        assert_eq!(owner[0].1, EventFlags::ITEM_CHANGE_OWNER | EventFlags::ITEM_IS_DIR);

        let xattr = translate(
            &event(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Extended)), &dir),
            &kinds,
        );
        assert_eq!(xattr[0].1, EventFlags::ITEM_XATTR_MOD | EventFlags::ITEM_IS_DIR);

        let perms = translate(
            &event(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)), &dir),
            &kinds,
        );
        assert_eq!(perms[0].1, EventFlags::ITEM_INODE_META_MOD | EventFlags::ITEM_IS_DIR);
    }

    #[test]
    fn test_translate_rename_reports_both_paths() {
        let temp_dir = TempDir::new().unwrap();
        let from = temp_dir.path().join("from");
        let to = temp_dir.path().join("to");
        std::fs::write(&to, b"x").unwrap();
        let kinds = KindCache::new();

        let renamed = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(from.clone())
            .add_path(to.clone());
        let flags = translate(&renamed, &kinds);

        assert_eq!(flags.len(), 2);
        assert_eq!(flags[0], (from, EventFlags::ITEM_RENAMED));
        assert_eq!(flags[1], (to, EventFlags::ITEM_RENAMED | EventFlags::ITEM_IS_FILE));
    }

    #[test]
    fn test_cache_forgets_items_that_leave() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("dir");
        let inner = dir.join("inner.txt");
        let moved = temp_dir.path().join("moved.txt");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(&inner, b"x").unwrap();
        std::fs::write(&moved, b"x").unwrap();
        let kinds = KindCache::new();

        translate(&event(EventKind::Create(CreateKind::Any), &dir), &kinds);
        translate(&event(EventKind::Create(CreateKind::Any), &inner), &kinds);
        translate(&event(EventKind::Create(CreateKind::Any), &moved), &kinds);
        assert_eq!(kinds.len(), 3);

        // Renamed away: reported with its last known kind, then forgotten
        std::fs::remove_file(&moved).unwrap();
        let renamed = translate(
            &event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &moved),
            &kinds,
        );
        assert_eq!(renamed[0].1, EventFlags::ITEM_RENAMED | EventFlags::ITEM_IS_FILE);
        assert!(kinds.get(&moved).is_none());

        // Removing a directory forgets what was below it
        std::fs::remove_dir_all(&dir).unwrap();
        let removed = translate(&event(EventKind::Remove(RemoveKind::Any), &dir), &kinds);
        assert_eq!(removed[0].1, EventFlags::ITEM_REMOVED | EventFlags::ITEM_IS_DIR);
        assert!(kinds.is_empty());
    }

    #[test]
    fn test_access_is_ignored() {
        let kinds = KindCache::new();
        let access = event(
            EventKind::Access(notify::event::AccessKind::Any),
            Path::new("/tmp/whatever"),
        );
        assert!(translate(&access, &kinds).is_empty());
    }
}
