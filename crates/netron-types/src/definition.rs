//! Context definitions: the serializable public surface of an attached context.
//!
//! Application code describes a context with a [`ContextDescriptor`]; the
//! runtime validates it once at attach time and freezes it into an immutable
//! [`Definition`] carrying a runtime-local id.

use crate::error::{NetronError, NetronResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Per-property metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    /// Property name.
    pub name: String,
    /// Whether remote writes are rejected.
    #[serde(default)]
    pub readonly: bool,
}

/// Immutable description of a context's public surface.
///
/// The id is unique only within the runtime that issued it; cross-process
/// references always pair it with the issuing peer's uid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    /// Runtime-local definition id.
    pub id: u64,
    /// Name the context is exposed under.
    pub name: String,
    /// Exposed method names.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Exposed properties.
    #[serde(default)]
    pub properties: Vec<PropertyDescriptor>,
}

/// What kind of member a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Member<'a> {
    Method,
    Property(&'a PropertyDescriptor),
}

impl Definition {
    /// Look up a member by name.
    pub fn member(&self, name: &str) -> Option<Member<'_>> {
        if self.methods.iter().any(|m| m == name) {
            return Some(Member::Method);
        }
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(Member::Property)
    }

    /// Whether `name` is an exposed method.
    pub fn has_method(&self, name: &str) -> bool {
        matches!(self.member(name), Some(Member::Method))
    }

    /// Property descriptor by name.
    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        match self.member(name) {
            Some(Member::Property(p)) => Some(p),
            _ => None,
        }
    }

    /// Resolve `name` as a method, with the error a caller should see otherwise.
    pub fn require_method(&self, name: &str) -> NetronResult<()> {
        match self.member(name) {
            Some(Member::Method) => Ok(()),
            Some(Member::Property(_)) => Err(NetronError::InvalidArgument(format!(
                "'{name}' is a property of '{}', not a method",
                self.name
            ))),
            None => Err(NetronError::Unknown(format!(
                "Unknown method '{name}' of context '{}'",
                self.name
            ))),
        }
    }

    /// Resolve `name` as a property, with the error a caller should see otherwise.
    pub fn require_property(&self, name: &str) -> NetronResult<&PropertyDescriptor> {
        match self.member(name) {
            Some(Member::Property(p)) => Ok(p),
            Some(Member::Method) => Err(NetronError::InvalidArgument(format!(
                "'{name}' is a method of '{}', not a property",
                self.name
            ))),
            None => Err(NetronError::Unknown(format!(
                "Unknown property '{name}' of context '{}'",
                self.name
            ))),
        }
    }
}

/// Static capability descriptor supplied by a context implementation.
///
/// An empty `class_name` marks an anonymous class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextDescriptor {
    /// Class name, used as the attach name when none is given.
    pub class_name: String,
    /// Private classes must be named to be attachable.
    pub private: bool,
    /// Public methods.
    pub methods: Vec<String>,
    /// Public properties.
    pub properties: Vec<PropertyDescriptor>,
}

impl ContextDescriptor {
    /// Start a descriptor for a named class.
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            ..Default::default()
        }
    }

    /// Start a descriptor for an anonymous class.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Mark the class private.
    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    /// Expose a method.
    pub fn method(mut self, name: impl Into<String>) -> Self {
        self.methods.push(name.into());
        self
    }

    /// Expose a writable property.
    pub fn property(mut self, name: impl Into<String>) -> Self {
        self.properties.push(PropertyDescriptor {
            name: name.into(),
            readonly: false,
        });
        self
    }

    /// Expose a read-only property.
    pub fn readonly_property(mut self, name: impl Into<String>) -> Self {
        self.properties.push(PropertyDescriptor {
            name: name.into(),
            readonly: true,
        });
        self
    }

    /// Check eligibility for attachment.
    pub fn validate(&self) -> NetronResult<()> {
        let anonymous = self.class_name.trim().is_empty();
        if anonymous && self.private {
            return Err(NetronError::NotAllowed(
                "Anonymous private class cannot be attached".to_string(),
            ));
        }
        if self.methods.is_empty() && self.properties.is_empty() {
            return Err(NetronError::NotValid(format!(
                "Class '{}' has no public methods or properties",
                self.display_name()
            )));
        }

        let mut seen = HashSet::new();
        let names = self
            .methods
            .iter()
            .map(String::as_str)
            .chain(self.properties.iter().map(|p| p.name.as_str()));
        for name in names {
            if name.trim().is_empty() {
                return Err(NetronError::NotValid(format!(
                    "Class '{}' exposes a member with an empty name",
                    self.display_name()
                )));
            }
            if !seen.insert(name) {
                return Err(NetronError::NotValid(format!(
                    "Class '{}' exposes '{name}' more than once",
                    self.display_name()
                )));
            }
        }
        Ok(())
    }

    /// Freeze into a definition with the given id and exposure name.
    pub fn into_definition(self, id: u64, name: impl Into<String>) -> Definition {
        Definition {
            id,
            name: name.into(),
            methods: self.methods,
            properties: self.properties,
        }
    }

    fn display_name(&self) -> &str {
        if self.class_name.is_empty() {
            "<anonymous>"
        } else {
            &self.class_name
        }
    }
}
