//! Recursive filesystem watch source
//!
//! Translates `notify` events into [`ChangeEvent`]s and records them in the
//! coalescer. Echo suppression happens in the coalescer, not here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use mfs_core::{ChangeEvent, Operation};

use crate::coalescer::Coalescer;

/// Keeps the OS watch alive; dropping it stops the notifications
pub struct FsWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
}

impl FsWatcher {
    /// Watch `root` recursively, feeding every change into `coalescer`
    pub fn start(root: impl Into<PathBuf>, coalescer: Arc<Coalescer>) -> notify::Result<Self> {
        let root = root.into();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in translate(&event) {
                    coalescer.record(change.observed());
                }
            }
            Err(e) => warn!("Watch error: {}", e),
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        info!("Watching {:?}", root);
        Ok(Self {
            root,
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Map one notify event to zero or more change events
pub fn translate(event: &Event) -> Vec<ChangeEvent> {
    let each = |op: Operation| -> Vec<ChangeEvent> {
        event
            .paths
            .iter()
            .map(|path| ChangeEvent::new(path.clone(), op))
            .collect()
    };

    match &event.kind {
        EventKind::Create(_) => each(Operation::Create),
        EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Modify(ModifyKind::Other) => each(Operation::Write),
        EventKind::Modify(ModifyKind::Metadata(_)) => each(Operation::Chmod),
        EventKind::Modify(ModifyKind::Name(mode)) => translate_rename(*mode, &event.paths),
        EventKind::Remove(_) => each(Operation::Remove),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => {
            debug!("Ignoring event {:?}", event.kind);
            Vec::new()
        }
    }
}

fn translate_rename(mode: RenameMode, paths: &[PathBuf]) -> Vec<ChangeEvent> {
    match mode {
        RenameMode::Both if paths.len() >= 2 => {
            vec![ChangeEvent::moved(paths[0].clone(), paths[1].clone())]
        }
        RenameMode::From => paths
            .iter()
            .map(|p| ChangeEvent::new(p.clone(), Operation::Remove))
            .collect(),
        RenameMode::To => paths
            .iter()
            .map(|p| ChangeEvent::new(p.clone(), Operation::Create))
            .collect(),
        // Unpaired renames: decide by whether the path is still there
        _ => paths
            .iter()
            .map(|p| {
                let op = if p.symlink_metadata().is_ok() {
                    Operation::Create
                } else {
                    Operation::Remove
                };
                ChangeEvent::new(p.clone(), op)
            })
            .collect(),
    }
}
