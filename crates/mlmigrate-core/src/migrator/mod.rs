//! Parent and child migrators.
//!
//! - [`ParentMigrator`]: state machine for one parent (export, experiment import, model import)
//! - [`ChildMigrator`]: copy of a single child, run inside the worker pool

mod child;
mod parent;
mod registry;

pub use child::{
    add_source_tags, ChildExporter, ChildImporter, ChildMigrator, ChildTask, PARENT_RUN_TAG,
    SOURCE_TAG_PREFIX,
};
pub use parent::{ParentMigrator, ParentOutcome, ParentState, LEGACY_ID_TAG, NOTE_TAG};
