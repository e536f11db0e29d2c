use std::fmt;
use std::sync::Arc;

/// An ordered sequence of string components naming a definition or package.
///
/// Two names are equal iff their component sequences are equal. Names come
/// in two forms with the same representation: the *source* form is what the
/// programmer wrote and resolves only public symbols; the *defn* form is the
/// canonical (possibly mangled) name the compiler assigned and resolves
/// every symbol of a package.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Name {
    components: Arc<[Arc<str>]>,
}

impl Name {
    pub fn new(components: Vec<Arc<str>>) -> Name {
        Name { components: components.into() }
    }

    pub fn from_components<'a>(components: impl IntoIterator<Item = &'a str>) -> Name {
        Name {
            components: components.into_iter().map(Arc::from).collect(),
        }
    }

    /// Parse a dotted source string, e.g. `"foo.bar.Baz"`. Components must
    /// be non-empty and contain no dots.
    pub fn from_source_string(text: &str) -> Option<Name> {
        if text.is_empty() {
            return None;
        }
        let components: Vec<Arc<str>> = text.split('.').map(Arc::from).collect();
        if components.iter().any(|c| c.is_empty()) {
            return None;
        }
        Some(Name { components: components.into() })
    }

    /// Parse a defn string. Defn names are dot-separated like source names
    /// but may contain mangling characters within components.
    pub fn from_defn_string(text: &str) -> Option<Name> {
        Self::from_source_string(text)
    }

    pub fn components(&self) -> &[Arc<str>] {
        &self.components
    }

    pub fn last(&self) -> &str {
        self.components.last().map(|c| c.as_ref()).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(component)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_component_equality() {
        let a = Name::from_source_string("foo.bar").unwrap();
        let b = Name::from_components(["foo", "bar"]);
        let c = Name::from_source_string("foo.baz").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn rejects_empty_components() {
        assert!(Name::from_source_string("").is_none());
        assert!(Name::from_source_string("foo..bar").is_none());
        assert!(Name::from_source_string(".foo").is_none());
    }

    #[test]
    fn displays_dotted() {
        let name = Name::from_source_string("a.b.c").unwrap();
        assert_eq!(name.to_string(), "a.b.c");
        assert_eq!(name.last(), "c");
    }
}
