//! Read view over a locked resource's cursor.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::store::{Resource, StoreError};

/// Cursor of a source currently held by an input task.
///
/// Reads see the most recently staged value, falling back to the last
/// committed one. Updates never go through this type; they travel with
/// published events and commit on acknowledgment, so a crash cannot persist
/// a cursor ahead of its data.
#[derive(Debug, Clone)]
pub struct Cursor {
    resource: Arc<Resource>,
}

impl Cursor {
    pub(crate) fn new(resource: Arc<Resource>) -> Self {
        Self { resource }
    }

    /// True while no cursor value has ever been staged or committed.
    pub fn is_new(&self) -> bool {
        self.resource.is_new()
    }

    /// Decode the cursor into a caller-provided type.
    ///
    /// Returns `Ok(None)` for a new cursor.
    ///
    /// # Errors
    ///
    /// Returns an error when the stored value does not deserialize into `T`.
    pub fn get<T: DeserializeOwned>(&self) -> Result<Option<T>, StoreError> {
        match self.resource.cursor_value() {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Deserialize, PartialEq)]
    struct FileOffset {
        offset: u64,
    }

    fn resource() -> Arc<Resource> {
        Arc::new(Resource::new("filestream-a".into(), Duration::from_secs(60)))
    }

    #[test]
    fn test_new_cursor_reads_none() {
        let cursor = Cursor::new(resource());
        assert!(cursor.is_new());
        assert_eq!(cursor.get::<FileOffset>().unwrap(), None);
    }

    #[test]
    fn test_typed_read_after_commit() {
        let resource = resource();
        {
            let mut state = resource.lock_state();
            state.cursor = Some(serde_json::json!({"offset": 42}));
        }
        let cursor = Cursor::new(resource);
        assert!(!cursor.is_new());
        assert_eq!(
            cursor.get::<FileOffset>().unwrap(),
            Some(FileOffset { offset: 42 })
        );
    }

    #[test]
    fn test_mismatched_shape_is_an_error() {
        let resource = resource();
        {
            let mut state = resource.lock_state();
            state.cursor = Some(serde_json::json!("plain string"));
        }
        let cursor = Cursor::new(resource);
        assert!(matches!(
            cursor.get::<FileOffset>(),
            Err(StoreError::Serde(_))
        ));
    }
}
