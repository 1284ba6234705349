use crate::error::StoreError;
use crate::traits::TemplateStore;
use crate::types::Embedding;
use std::collections::HashMap;

/// Process-local template store. Fetch returns exactly what was saved.
#[derive(Debug, Default, Clone)]
pub struct MemoryTemplateStore {
    templates: HashMap<String, Embedding>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove(&mut self, identity: &str) -> bool {
        self.templates.remove(identity).is_some()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl TemplateStore for MemoryTemplateStore {
    fn save(&mut self, identity: &str, template: &Embedding) -> Result<(), StoreError> {
        self.templates.insert(identity.to_string(), template.clone());
        Ok(())
    }

    fn fetch(&self, identity: &str) -> Result<Option<Embedding>, StoreError> {
        Ok(self.templates.get(identity).cloned())
    }
}
