//! Flattening the pending tree into one multi-path remote write.

use serde_json::Value;
use tracing::debug;

use treesync_common::tree::get_at;
use treesync_common::StatePath;
use treesync_storage::WriteBatch;

use crate::modified::{
    annotate_outgoing, annotate_units, marker_path_for, sentinel, strip_markers, Tracking,
};
use crate::pending::{PendingNode, PendingTree};
use crate::spec::{FieldTransform, ModifiedSpec};
use crate::transform::{remote_path, to_remote_shape};

/// One remote write, relative to the sync root.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteWrite {
    pub path: StatePath,
    pub value: Value,
    /// Whether this write only stamps a unit's marker (`unit/@`).
    pub marker: bool,
}

/// A tracked unit covered by a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitRef {
    pub local: StatePath,
    /// Remote path relative to the sync root.
    pub remote: StatePath,
}

/// Result of flattening the pending tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub writes: Vec<RemoteWrite>,
    /// Units stamped by this batch.
    pub units: Vec<UnitRef>,
    /// Units whose writes were dropped because the remote already holds
    /// their value.
    pub unchanged: Vec<UnitRef>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Flat `/base/remote/path -> value` mapping for the backend.
    pub fn to_write_batch(&self, base: &StatePath) -> WriteBatch {
        self.writes
            .iter()
            .map(|write| {
                let path = if write.marker {
                    marker_path_for(&write.path)
                } else {
                    write.path.clone()
                };
                (base.concat(&path).to_string_path(), write.value.clone())
            })
            .collect()
    }
}

/// Inputs of [`construct_batch`].
#[derive(Debug, Clone, Copy)]
pub struct BatchContext<'a> {
    pub modified: &'a ModifiedSpec,
    pub transform: &'a FieldTransform,
    /// Remote mirror relative to the sync root, for dropping no-op writes.
    pub mirror: Option<&'a Value>,
}

#[derive(Clone)]
struct Cursor<'a> {
    local: StatePath,
    remote: StatePath,
    tracking: Tracking<'a>,
    transform: Option<&'a FieldTransform>,
}

impl<'a> Cursor<'a> {
    fn descend(&self, key: &str) -> Cursor<'a> {
        let (remote_key, transform) = match self.transform {
            Some(transform) => transform.outgoing_child(key),
            None => (key.to_string(), None),
        };
        Cursor {
            local: self.local.child(key),
            remote: self.remote.child(&remote_key),
            tracking: self.tracking.descend(key),
            transform,
        }
    }
}

/// Walk the pending tree with the tracking and transform specs in
/// lockstep and produce the minimal set of remote writes.
///
/// - A replacement yields one write of its transformed value, with every
///   tracked unit inside it annotated.
/// - Finer entries below a unit yield one write each plus one marker
///   write for the unit.
/// - Untracked interior nodes never yield a combined write.
pub fn construct_batch(pending: &PendingTree, ctx: &BatchContext<'_>) -> Batch {
    let mut batch = Batch::default();
    let Some(root) = pending.root() else {
        return batch;
    };

    let cursor = Cursor {
        local: StatePath::root(),
        remote: StatePath::root(),
        tracking: Tracking::Spec(ctx.modified),
        transform: Some(ctx.transform),
    };
    visit(root, &cursor, ctx, &mut batch);

    if let Some(mirror) = ctx.mirror {
        drop_unchanged(&mut batch, mirror);
    }
    batch
}

fn visit(node: &PendingNode, cursor: &Cursor<'_>, ctx: &BatchContext<'_>, batch: &mut Batch) {
    match node {
        PendingNode::Replacement(value) => {
            let annotated = match cursor.tracking {
                Tracking::Unit => {
                    batch.units.push(UnitRef {
                        local: cursor.local.clone(),
                        remote: cursor.remote.clone(),
                    });
                    annotate_outgoing(value.clone())
                }
                Tracking::Spec(spec) => {
                    let (annotated, units) = annotate_units(spec, &cursor.local, value.clone());
                    batch.units.extend(units.into_iter().map(|local| UnitRef {
                        remote: remote_path(ctx.transform, &local).0,
                        local,
                    }));
                    annotated
                }
                Tracking::InsideUnit | Tracking::Untracked => value.clone(),
            };
            let shaped = match cursor.transform {
                Some(transform) => to_remote_shape(annotated, transform),
                None => annotated,
            };
            batch.writes.push(RemoteWrite {
                path: cursor.remote.clone(),
                value: shaped,
                marker: false,
            });
        }
        PendingNode::Internal(children) => {
            if cursor.tracking == Tracking::Unit {
                batch.units.push(UnitRef {
                    local: cursor.local.clone(),
                    remote: cursor.remote.clone(),
                });
                batch.writes.push(RemoteWrite {
                    path: cursor.remote.clone(),
                    value: sentinel(),
                    marker: true,
                });
            }
            for (key, child) in children {
                visit(child, &cursor.descend(key), ctx, batch);
            }
        }
    }
}

/// Drop writes whose value the remote already holds, then marker writes
/// and units left without any value write.
fn drop_unchanged(batch: &mut Batch, mirror: &Value) {
    batch.writes.retain(|write| {
        if write.marker {
            return true;
        }
        let current = get_at(mirror, &write.path).cloned().unwrap_or(Value::Null);
        let unchanged = strip_markers(write.value.clone()) == strip_markers(current);
        if unchanged {
            debug!("Dropping no-op write at {}", write.path);
        }
        !unchanged
    });

    let value_paths: Vec<StatePath> = batch
        .writes
        .iter()
        .filter(|write| !write.marker)
        .map(|write| write.path.clone())
        .collect();

    batch.writes.retain(|write| {
        !write.marker
            || value_paths
                .iter()
                .any(|path| path.starts_with(&write.path) && path != &write.path)
    });

    let (kept, unchanged): (Vec<UnitRef>, Vec<UnitRef>) =
        std::mem::take(&mut batch.units).into_iter().partition(|unit| {
            value_paths.iter().any(|path| path.overlaps(&unit.remote))
        });
    batch.units = kept;
    batch.unchanged = unchanged;
}
