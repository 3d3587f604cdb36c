use std::sync::Mutex;

use uuid::Uuid;

/// Hands out row identifiers, never returning the same id twice in a row.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: Mutex<Option<Uuid>>,
}

impl IdGenerator {
    pub fn next_id(&self) -> String {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let mut id = Uuid::new_v4();
        while Some(id) == *last {
            id = Uuid::new_v4();
        }
        *last = Some(id);
        id.to_string()
    }
}
