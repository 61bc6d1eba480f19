//! Value provenance
//!
//! Every configurable value carries where it came from. The planner uses the
//! provenance to tell a user-requested change apart from two sides that are
//! merely reporting their own defaults.

use serde::{Deserialize, Serialize};

/// A value tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "value", rename_all = "snake_case")]
pub enum Field<T> {
    /// Set by the user, or reported explicitly by the remote side
    Explicit(T),
    /// Filled in from the [`DefaultPolicy`](crate::DefaultPolicy) because the user left it out
    ProviderDefault(T),
    /// Omitted by the remote side and filled in with its documented default
    RemoteDefault(T),
}

impl<T> Field<T> {
    /// Desired-side constructor: `Some` is explicit, `None` falls back to the policy default.
    pub fn from_user(value: Option<T>, default: T) -> Self {
        match value {
            Some(v) => Field::Explicit(v),
            None => Field::ProviderDefault(default),
        }
    }

    /// Observed-side constructor: `Some` is explicit, `None` falls back to the remote default.
    pub fn from_remote(value: Option<T>, default: T) -> Self {
        match value {
            Some(v) => Field::Explicit(v),
            None => Field::RemoteDefault(default),
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Field::Explicit(v) | Field::ProviderDefault(v) | Field::RemoteDefault(v) => v,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Field::Explicit(v) | Field::ProviderDefault(v) | Field::RemoteDefault(v) => v,
        }
    }

    pub fn is_explicit(&self) -> bool {
        matches!(self, Field::Explicit(_))
    }

    pub fn is_provider_default(&self) -> bool {
        matches!(self, Field::ProviderDefault(_))
    }

    pub fn is_remote_default(&self) -> bool {
        matches!(self, Field::RemoteDefault(_))
    }

    pub fn as_ref(&self) -> Field<&T> {
        match self {
            Field::Explicit(v) => Field::Explicit(v),
            Field::ProviderDefault(v) => Field::ProviderDefault(v),
            Field::RemoteDefault(v) => Field::RemoteDefault(v),
        }
    }

    /// Maps the value while keeping the provenance.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Field<U> {
        match self {
            Field::Explicit(v) => Field::Explicit(f(v)),
            Field::ProviderDefault(v) => Field::ProviderDefault(f(v)),
            Field::RemoteDefault(v) => Field::RemoteDefault(f(v)),
        }
    }

    /// Combines two fields that share one remote parameter.
    ///
    /// The pair keeps a default tag only when both halves carry the same one.
    pub fn zip<U>(self, other: Field<U>) -> Field<(T, U)> {
        match (self, other) {
            (Field::ProviderDefault(a), Field::ProviderDefault(b)) => Field::ProviderDefault((a, b)),
            (Field::RemoteDefault(a), Field::RemoteDefault(b)) => Field::RemoteDefault((a, b)),
            (a, b) => Field::Explicit((a.into_value(), b.into_value())),
        }
    }
}

impl<T: PartialEq> Field<T> {
    /// Whether moving from `observed` to `self` requires a remote write.
    ///
    /// Equal values never do. A provider default facing a remote default is
    /// two systems describing their own defaults and is not drift either.
    pub fn differs_from(&self, observed: &Field<T>) -> bool {
        if self.value() == observed.value() {
            return false;
        }
        !(self.is_provider_default() && observed.is_remote_default())
    }
}

impl<T: Default> Default for Field<T> {
    fn default() -> Self {
        Field::ProviderDefault(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_user() {
        assert_eq!(Field::from_user(Some(4), 1), Field::Explicit(4));
        assert_eq!(Field::from_user(None, 1), Field::ProviderDefault(1));
    }

    #[test]
    fn test_equal_values_never_differ() {
        assert!(!Field::Explicit(2).differs_from(&Field::RemoteDefault(2)));
        assert!(!Field::ProviderDefault(2).differs_from(&Field::Explicit(2)));
    }

    #[test]
    fn test_default_against_default_is_not_drift() {
        let desired = Field::ProviderDefault("qemu64".to_string());
        let observed = Field::RemoteDefault("kvm64".to_string());
        assert!(!desired.differs_from(&observed));
    }

    #[test]
    fn test_provider_default_against_explicit_is_drift() {
        let desired = Field::ProviderDefault(512);
        let observed = Field::Explicit(2048);
        assert!(desired.differs_from(&observed));
    }

    #[test]
    fn test_explicit_against_remote_default_is_drift() {
        assert!(Field::Explicit(4).differs_from(&Field::RemoteDefault(1)));
    }

    #[test]
    fn test_zip_keeps_shared_tag() {
        let zipped = Field::ProviderDefault(1).zip(Field::ProviderDefault("a"));
        assert!(zipped.is_provider_default());

        let mixed = Field::ProviderDefault(1).zip(Field::RemoteDefault("a"));
        assert!(mixed.is_explicit());
        assert_eq!(mixed.into_value(), (1, "a"));
    }
}
