//! Single-pass cursor over an engine string collection.

use std::iter::FusedIterator;
use std::sync::Arc;

use super::{Handle, StringCollectionKind, StringHandle};
use crate::ffi::{EngineApi, RawHandle};

/// Forward-only iterator over an engine-owned string collection.
///
/// Each step asks the engine for the next element, decodes it, and releases
/// the element before yielding, so at most one element string is alive at a
/// time. The first null element ends the sequence for good; the cursor is
/// not restartable. The collection itself is released when the cursor is
/// dropped.
pub struct StringCursor {
    collection: Handle<StringCollectionKind>,
    finished: bool,
}

impl StringCursor {
    /// Takes ownership of a raw collection reference.
    pub fn new(api: Arc<dyn EngineApi>, raw: RawHandle) -> Self {
        let collection = Handle::wrap(api, raw);
        let finished = !collection.is_valid();
        Self {
            collection,
            finished,
        }
    }

    /// Reads every remaining element in source order.
    pub fn drain(self) -> Vec<String> {
        self.collect()
    }
}

impl Iterator for StringCursor {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.finished {
            return None;
        }
        let api = Arc::clone(self.collection.api());
        // SAFETY: `finished` is only false while the collection is valid, and
        // the collection is owned by this cursor.
        let raw = unsafe { api.string_collection_next(self.collection.as_raw()) };
        let item = StringHandle::wrap(api, raw);

        match item.into_string() {
            Some(value) => Some(value),
            None => {
                self.finished = true;
                self.collection.release();
                None
            }
        }
    }
}

impl FusedIterator for StringCursor {}
