use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;

type AttrValue = Arc<dyn Any + Send + Sync>;

/// Server-wide attribute container.
///
/// Shared, concurrently readable name → value storage for data that filters,
/// handlers and components need to exchange outside the component registry
/// (feature flags, build info, shared counters). Values are typed on read.
#[derive(Default)]
pub struct Attributes {
    inner: DashMap<String, AttrValue>,
}

impl Attributes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `name`, replacing any previous value.
    pub fn set<T: Any + Send + Sync>(&self, name: impl Into<String>, value: T) {
        self.inner.insert(name.into(), Arc::new(value));
    }

    /// Fetch `name` if present and of type `T`.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let value = Arc::clone(self.inner.get(name)?.value());
        value.downcast::<T>().ok()
    }

    pub fn remove(&self, name: &str) -> bool {
        self.inner.remove(name).is_some()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_get() {
        let attrs = Attributes::new();
        attrs.set("version", String::from("1.2.3"));
        attrs.set("workers", 4usize);

        assert_eq!(attrs.get::<String>("version").unwrap().as_str(), "1.2.3");
        assert_eq!(*attrs.get::<usize>("workers").unwrap(), 4);
        assert!(attrs.get::<u32>("workers").is_none(), "wrong type");
        assert!(attrs.get::<String>("missing").is_none());
    }

    #[test]
    fn test_remove() {
        let attrs = Attributes::new();
        attrs.set("k", 1u8);
        assert!(attrs.contains("k"));
        assert!(attrs.remove("k"));
        assert!(!attrs.remove("k"));
        assert!(attrs.is_empty());
    }
}
