// Copyright 2024 The Gantry Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Structural paths into the metadata tree. A path is an ordered sequence of
//! validated segments; equality and ordering are lexicographic over segments,
//! so path-indexed `BTreeMap`s sort the way the store lists directories.

use std::fmt::{Debug, Display, Error, Formatter};
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum TreePathParseError {
    #[error(r#"Empty path component in "{input}""#)]
    EmptyComponent { input: String },
    #[error(r#"Invalid path component "{component}" in "{input}""#)]
    InvalidComponent { component: String, input: String },
}

/// A single path segment. Must be non-empty, must not be `.` or `..`, and
/// must not contain `/`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TreePathComponent {
    value: String,
}

impl TreePathComponent {
    pub fn new(value: impl Into<String>) -> Result<Self, TreePathParseError> {
        let value = value.into();
        if value.is_empty() {
            return Err(TreePathParseError::EmptyComponent { input: value });
        }
        if value == "." || value == ".." || value.contains('/') {
            return Err(TreePathParseError::InvalidComponent {
                component: value.clone(),
                input: value,
            });
        }
        Ok(TreePathComponent { value })
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Debug for TreePathComponent {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.write_fmt(format_args!("{:?}", &self.value))
    }
}

impl Display for TreePathComponent {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.write_str(&self.value)
    }
}

impl FromStr for TreePathComponent {
    type Err = TreePathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TreePathComponent::new(s)
    }
}

#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TreePath {
    components: Vec<TreePathComponent>,
}

impl TreePath {
    pub fn root() -> Self {
        TreePath { components: vec![] }
    }

    pub fn from_components(components: Vec<TreePathComponent>) -> Self {
        TreePath { components }
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &[TreePathComponent] {
        &self.components
    }

    /// Appends one segment (the `a / s` operation).
    pub fn child(&self, component: TreePathComponent) -> TreePath {
        let mut components = self.components.clone();
        components.push(component);
        TreePath { components }
    }

    /// Concatenates two paths (the `a /@ b` operation).
    pub fn join(&self, other: &TreePath) -> TreePath {
        let mut components = self.components.clone();
        components.extend(other.components.iter().cloned());
        TreePath { components }
    }

    pub fn parent(&self) -> Option<TreePath> {
        match self.components.len() {
            0 => None,
            n => Some(TreePath {
                components: self.components[..n - 1].to_vec(),
            }),
        }
    }

    pub fn basename(&self) -> Option<&TreePathComponent> {
        self.components.last()
    }

    pub fn starts_with(&self, base: &TreePath) -> bool {
        self.components.starts_with(&base.components)
    }
}

impl Debug for TreePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.write_fmt(format_args!("{:?}", self.to_string()))
    }
}

impl Display for TreePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        let mut first = true;
        for component in &self.components {
            if !first {
                f.write_str("/")?;
            }
            f.write_str(component.value())?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for TreePath {
    type Err = TreePathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut components = vec![];
        for part in s.split('/') {
            let component = TreePathComponent::new(part).map_err(|err| match err {
                TreePathParseError::EmptyComponent { .. } => {
                    TreePathParseError::EmptyComponent {
                        input: s.to_owned(),
                    }
                }
                TreePathParseError::InvalidComponent { component, .. } => {
                    TreePathParseError::InvalidComponent {
                        component,
                        input: s.to_owned(),
                    }
                }
            })?;
            components.push(component);
        }
        Ok(TreePath { components })
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("foo")]
    #[test_case("foo/bar")]
    #[test_case("foo/bar/baz")]
    #[test_case("heads/my.branch/x")]
    #[test_case(".monitor")]
    fn test_round_trip(text: &str) {
        let path: TreePath = text.parse().unwrap();
        assert_eq!(path.to_string(), text);
    }

    #[test_case(""; "empty path")]
    #[test_case("."; "dot")]
    #[test_case(".."; "dot dot")]
    #[test_case("/foo"; "leading slash")]
    #[test_case("foo/"; "trailing slash")]
    #[test_case("foo//bar"; "double slash")]
    #[test_case("foo/./bar"; "inner dot")]
    #[test_case("foo/../bar"; "inner dot dot")]
    fn test_rejects(text: &str) {
        assert!(text.parse::<TreePath>().is_err());
    }

    #[test]
    fn test_component_rejects_slash() {
        assert!(TreePathComponent::new("a/b").is_err());
        assert!(TreePathComponent::new("").is_err());
        assert!(TreePathComponent::new(".").is_err());
        assert!(TreePathComponent::new("..").is_err());
    }

    #[test]
    fn test_join_and_child() {
        let a: TreePath = "foo/bar".parse().unwrap();
        let b: TreePath = "baz/qux".parse().unwrap();
        assert_eq!(a.join(&b).to_string(), "foo/bar/baz/qux");
        let child = a.child(TreePathComponent::new("baz").unwrap());
        assert_eq!(child.to_string(), "foo/bar/baz");
        assert_eq!(child.parent(), Some(a.clone()));
        assert!(child.starts_with(&a));
        assert!(!a.starts_with(&child));
    }

    #[test]
    fn test_ordering_is_lexicographic_over_segments() {
        let mut paths: Vec<TreePath> = ["b", "a/c", "a", "a/b"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        paths.sort();
        let sorted: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        assert_eq!(sorted, vec!["a", "a/b", "a/c", "b"]);
    }
}
