use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Insertion-ordered environment list with last-write-wins assignment.
///
/// A key keeps the position of its first insertion and takes the value of
/// its last write, so rendering the list twice always yields the same order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvVars(Vec<(String, String)>);

impl EnvVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, replacing any earlier value in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvVars {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut vars = EnvVars::new();
        for (key, value) in iter {
            vars.insert(key, value);
        }
        vars
    }
}

impl Serialize for EnvVars {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for EnvVars {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EnvVisitor;

        impl<'de> Visitor<'de> for EnvVisitor {
            type Value = EnvVars;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of environment variable names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<EnvVars, A::Error> {
                let mut vars = EnvVars::new();
                while let Some((key, value)) = access.next_entry::<String, ScalarString>()? {
                    vars.insert(key, value.0);
                }
                Ok(vars)
            }
        }

        deserializer.deserialize_map(EnvVisitor)
    }
}

/// Accepts YAML scalars of any type (`PORT: 8080`, `DEBUG: true`) as strings.
struct ScalarString(String);

impl<'de> Deserialize<'de> for ScalarString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ScalarVisitor;

        impl Visitor<'_> for ScalarVisitor {
            type Value = ScalarString;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string, number or boolean")
            }

            fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<ScalarString, E> {
                Ok(ScalarString(value.to_string()))
            }

            fn visit_bool<E: serde::de::Error>(self, value: bool) -> Result<ScalarString, E> {
                Ok(ScalarString(value.to_string()))
            }

            fn visit_i64<E: serde::de::Error>(self, value: i64) -> Result<ScalarString, E> {
                Ok(ScalarString(value.to_string()))
            }

            fn visit_u64<E: serde::de::Error>(self, value: u64) -> Result<ScalarString, E> {
                Ok(ScalarString(value.to_string()))
            }

            fn visit_f64<E: serde::de::Error>(self, value: f64) -> Result<ScalarString, E> {
                Ok(ScalarString(value.to_string()))
            }
        }

        deserializer.deserialize_any(ScalarVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_first_position_and_last_value() {
        let mut vars = EnvVars::new();
        vars.insert("A", "1");
        vars.insert("B", "2");
        vars.insert("A", "3");

        let entries: Vec<_> = vars.iter().collect();
        assert_eq!(entries, vec![("A", "3"), ("B", "2")]);
    }

    #[test]
    fn remove_drops_entry() {
        let mut vars = EnvVars::new().with("A", "1");
        assert_eq!(vars.remove("A").as_deref(), Some("1"));
        assert!(vars.is_empty());
        assert_eq!(vars.remove("A"), None);
    }

    #[test]
    fn deserialize_preserves_yaml_order_and_stringifies_scalars() {
        let vars: EnvVars = serde_yaml::from_str("ZED: last\nPORT: 8080\nDEBUG: true\n").unwrap();
        let entries: Vec<_> = vars.iter().collect();
        assert_eq!(
            entries,
            vec![("ZED", "last"), ("PORT", "8080"), ("DEBUG", "true")]
        );
    }

    #[test]
    fn deserialize_rejects_sequences() {
        let result: Result<EnvVars, _> = serde_yaml::from_str("- A\n- B\n");
        assert!(result.is_err());
    }
}
