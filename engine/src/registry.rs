//! Class registry.
//!
//! Maps class names to constructors so decoded payloads produce records of
//! the right shape. Classes that were never registered decode into generic
//! records.

use crate::{config::DEFAULT_CLASS_NAME, ClassName, Record};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Builds an empty record of one class.
pub type Constructor = Arc<dyn Fn() -> Record + Send + Sync>;

/// Class name to constructor lookup, injected into the profiler.
#[derive(Clone)]
pub struct ClassRegistry {
    default_class: ClassName,
    constructors: HashMap<ClassName, Constructor>,
}

impl ClassRegistry {
    /// Create an empty registry. `default_class` names payloads that carry
    /// no class name.
    pub fn new(default_class: impl Into<ClassName>) -> Self {
        Self {
            default_class: default_class.into(),
            constructors: HashMap::new(),
        }
    }

    /// Register a constructor, replacing any earlier one for the class.
    pub fn register<F>(&mut self, class_name: impl Into<ClassName>, constructor: F) -> &mut Self
    where
        F: Fn() -> Record + Send + Sync + 'static,
    {
        self.constructors
            .insert(class_name.into(), Arc::new(constructor));
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_class<F>(mut self, class_name: impl Into<ClassName>, constructor: F) -> Self
    where
        F: Fn() -> Record + Send + Sync + 'static,
    {
        self.register(class_name, constructor);
        self
    }

    pub fn is_registered(&self, class_name: &str) -> bool {
        self.constructors.contains_key(class_name)
    }

    pub fn default_class(&self) -> &str {
        &self.default_class
    }

    /// Registered class names, sorted.
    pub fn class_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build an empty record of `class_name`.
    ///
    /// A constructor that yields a record of another class is ignored and a
    /// generic record is returned instead.
    pub fn instantiate(&self, class_name: &str) -> Record {
        let Some(constructor) = self.constructors.get(class_name) else {
            return Record::new(class_name);
        };

        let mut record = constructor();
        if record.class_name() != class_name {
            tracing::warn!(
                class = %class_name,
                built = %record.class_name(),
                "constructor built a record of another class"
            );
            return Record::new(class_name);
        }
        // Defaults set by a constructor are local state, not changes to send.
        record.reset_operations();
        record
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CLASS_NAME)
    }
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("default_class", &self.default_class)
            .field("classes", &self.class_names())
            .finish()
    }
}
