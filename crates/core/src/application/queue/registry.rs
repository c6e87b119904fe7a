// Processor registry keyed by (queue, job name)

use crate::application::locks::{read, write};
use crate::port::JobProcessor;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Default)]
pub(crate) struct ProcessorRegistry {
    processors: RwLock<HashMap<(String, String), Arc<dyn JobProcessor>>>,
}

impl ProcessorRegistry {
    /// Returns true if a previous processor was replaced
    pub fn insert(&self, queue: &str, name: &str, processor: Arc<dyn JobProcessor>) -> bool {
        write(&self.processors)
            .insert((queue.to_string(), name.to_string()), processor)
            .is_some()
    }

    pub fn get(&self, queue: &str, name: &str) -> Option<Arc<dyn JobProcessor>> {
        read(&self.processors)
            .get(&(queue.to_string(), name.to_string()))
            .cloned()
    }
}
