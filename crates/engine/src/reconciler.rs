//! Diff-and-apply between resource snapshots and the projected file tree.
//!
//! The api-server delivers whole objects, not per-key diffs, so the
//! reconciler keeps the previous snapshot of every resource to detect
//! removed data keys and destination-folder moves. All caches are owned by
//! one reconciler and every reconciler is owned by exactly one sync loop,
//! so none of this needs locking.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use configuration::Settings;
use support::{fs, net::Notifier, script};
use tracing::{debug, error, info, warn};

use crate::{
    resolver,
    snapshot::{DataValue, EventKind, ResourceKey, Snapshot},
};

#[derive(Debug, thiserror::Error)]
enum EntryError {
    #[error(transparent)]
    Resolve(#[from] resolver::ResolveError),
    #[error(transparent)]
    Projection(#[from] fs::ProjectionError),
}

pub struct Reconciler {
    settings: Arc<Settings>,
    notifier: Arc<Notifier>,
    seen_versions: HashMap<ResourceKey, String>,
    last_objects: HashMap<ResourceKey, Snapshot>,
    last_folders: HashMap<ResourceKey, PathBuf>,
}

impl Reconciler {
    pub fn new(settings: Arc<Settings>, notifier: Arc<Notifier>) -> Self {
        Self {
            settings,
            notifier,
            seen_versions: HashMap::new(),
            last_objects: HashMap::new(),
            last_folders: HashMap::new(),
        }
    }

    /// Applies one watch event; fires the post-change hooks when any file
    /// was written or removed.
    pub async fn apply_event(&mut self, event: EventKind, snapshot: Snapshot) {
        if self.reconcile_one(event, snapshot).await {
            self.run_hooks().await;
        }
    }

    /// Reconciles the complete set of currently matching resources, then
    /// synthesizes deletions for every cached resource that is gone. At
    /// most one hook invocation per pass.
    pub async fn apply_full_set(&mut self, snapshots: Vec<Snapshot>) {
        let mut changed = false;
        let present: HashSet<ResourceKey> = snapshots.iter().map(Snapshot::key).collect();

        for snapshot in snapshots {
            changed |= self.reconcile_one(EventKind::Modified, snapshot).await;
        }

        let vanished: Vec<Snapshot> = self
            .last_objects
            .values()
            .filter(|snapshot| !present.contains(&snapshot.key()))
            .cloned()
            .collect();
        for snapshot in vanished {
            debug!("removing {} {}", snapshot.kind, snapshot.key());
            let dest = self
                .last_folders
                .get(&snapshot.key())
                .cloned()
                .unwrap_or_else(|| self.destination_folder(&snapshot));
            changed |= self.process_snapshot(snapshot, dest, true).await;
        }

        if changed {
            self.run_hooks().await;
        }
    }

    async fn reconcile_one(&mut self, event: EventKind, snapshot: Snapshot) -> bool {
        let key = snapshot.key();

        // Suppress reprocessing of an already seen resource version; mostly
        // relevant after watch reconnects, which replay the full list.
        if self.settings.ignore_already_processed && snapshot.resource_version.is_some() {
            let seen = self.seen_versions.get(&key);
            if seen.is_some() && seen == snapshot.resource_version.as_ref() {
                match event {
                    EventKind::Added | EventKind::Modified => {
                        debug!("ignoring {event} {} {key}", snapshot.kind);
                        return false;
                    },
                    EventKind::Deleted => {
                        self.seen_versions.remove(&key);
                    },
                }
            } else if event != EventKind::Deleted {
                if let Some(version) = &snapshot.resource_version {
                    self.seen_versions.insert(key.clone(), version.clone());
                }
            }
        }

        debug!("working on {event} {} {key}", snapshot.kind);

        let dest = self.destination_folder(&snapshot);
        self.process_snapshot(snapshot, dest, event == EventKind::Deleted).await
    }

    /// Resolves where a resource's files belong: the annotation override
    /// when present (absolute, or joined onto the global target folder),
    /// the global target folder otherwise.
    fn destination_folder(&self, snapshot: &Snapshot) -> PathBuf {
        match snapshot.annotations.get(&self.settings.folder_annotation) {
            Some(value) => {
                let path = Path::new(value);
                let dest = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    self.settings.folder.join(path)
                };
                info!("found a folder override annotation, placing {} in {}", snapshot.name, dest.display());
                dest
            },
            None => self.settings.folder.clone(),
        }
    }

    async fn process_snapshot(&mut self, snapshot: Snapshot, dest: PathBuf, removed: bool) -> bool {
        let key = snapshot.key();
        let old = self.last_objects.get(&key).cloned();
        let old_dest = self.last_folders.get(&key).cloned().unwrap_or_else(|| dest.clone());

        if removed {
            self.last_objects.remove(&key);
            self.last_folders.remove(&key);
        } else {
            self.last_objects.insert(key.clone(), snapshot.clone());
            self.last_folders.insert(key.clone(), dest.clone());
        }

        if snapshot.data.is_empty() {
            warn!("no data field in {} {key}", snapshot.kind);
        }

        let mut changed = self.project_entries(&snapshot, &snapshot.data, &dest, removed).await;

        // For a live resource, clean up data keys that disappeared, and the
        // whole previous set when the destination folder moved.
        if !removed {
            if let Some(mut old_snapshot) = old {
                if old_dest == dest {
                    old_snapshot.data.retain(|data_key, _| !snapshot.data.contains_key(data_key));
                }
                changed |= self
                    .project_entries(&old_snapshot, &old_snapshot.data, &old_dest, true)
                    .await;
            }
        }

        changed
    }

    async fn project_entries(
        &self,
        owner: &Snapshot,
        entries: &BTreeMap<String, DataValue>,
        dest: &Path,
        remove: bool,
    ) -> bool {
        let mut changed = false;
        for (data_key, value) in entries {
            match self.project_entry(owner, data_key, value, dest, remove).await {
                Ok(entry_changed) => changed |= entry_changed,
                Err(err) => {
                    error!("error when updating from {data_key:?} into {}: {err}", dest.display())
                },
            }
        }
        changed
    }

    async fn project_entry(
        &self,
        owner: &Snapshot,
        data_key: &str,
        value: &DataValue,
        dest: &Path,
        remove: bool,
    ) -> Result<bool, EntryError> {
        if remove {
            let filename = self.final_filename(owner, resolver::target_filename(data_key));
            return Ok(fs::remove_file(dest, &filename).await?);
        }

        let resolved = resolver::resolve(data_key, value, &self.notifier).await?;
        let filename = self.final_filename(owner, &resolved.filename);
        Ok(fs::write_file(dest, &filename, &resolved.bytes, self.settings.default_file_mode).await?)
    }

    fn final_filename(&self, owner: &Snapshot, filename: &str) -> String {
        if self.settings.unique_filenames {
            resolver::unique_filename(filename, &owner.namespace, owner.kind, &owner.name)
        } else {
            filename.to_string()
        }
    }

    async fn run_hooks(&self) {
        if let Some(script) = &self.settings.script {
            script::execute(script).await;
        }
        self.notifier.notify().await;
    }
}
