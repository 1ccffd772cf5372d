//! Binding keys: the identity of a scoped object inside a context.

use std::any::{TypeId, type_name};
use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifies one scoped binding: a value type plus an optional qualifier.
///
/// Two keys are equal iff they name the same type and the same qualifier.
/// The type name is carried only for diagnostics and cluster snapshots.
#[derive(Clone)]
pub struct Key {
    type_id: TypeId,
    type_name: &'static str,
    qualifier: Option<Cow<'static, str>>,
}

impl Key {
    /// Unqualified key for `T`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            qualifier: None,
        }
    }

    /// Key for `T` distinguished by `qualifier`.
    pub fn qualified<T: ?Sized + 'static>(qualifier: impl Into<Cow<'static, str>>) -> Self {
        Self {
            qualifier: Some(qualifier.into()),
            ..Self::of::<T>()
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn qualifier(&self) -> Option<&str> {
        self.qualifier.as_deref()
    }

    /// Whether this key names values of type `T`.
    pub fn is_type<T: ?Sized + 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Stable textual name used when a context crosses a process boundary.
    pub fn wire_name(&self) -> String {
        match &self.qualifier {
            Some(q) => format!("{}#{}", self.type_name, q),
            None => self.type_name.to_string(),
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.qualifier == other.qualifier
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.qualifier.hash(state);
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key<{}>", self.wire_name())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct Service;

    #[test]
    fn equality_is_type_and_qualifier() {
        assert_eq!(Key::of::<Service>(), Key::of::<Service>());
        assert_eq!(Key::qualified::<Service>("a"), Key::qualified::<Service>("a"));
        assert_ne!(Key::qualified::<Service>("a"), Key::qualified::<Service>("b"));
        assert_ne!(Key::of::<Service>(), Key::qualified::<Service>("a"));
        assert_ne!(Key::of::<Service>(), Key::of::<String>());
    }

    #[test]
    fn hash_agrees_with_eq() {
        let mut set = HashSet::new();
        set.insert(Key::qualified::<Service>(String::from("primary")));
        assert!(set.contains(&Key::qualified::<Service>("primary")));
        assert!(!set.contains(&Key::of::<Service>()));
    }

    #[test]
    fn wire_name_includes_qualifier() {
        let key = Key::qualified::<String>("greeting");
        assert!(key.wire_name().ends_with("String#greeting"));
        assert!(key.is_type::<String>());
    }
}
