//! Canonical URN parsing, normalization and serialization (spec §3, §9).
//!
//! Canonical form is `scheme://domain/path#fragment`. A bare filesystem
//! path is normalized to `file:///absolute/path`. Path segments are
//! always kept normalized (`.`/`..` collapsed, duplicate slashes
//! removed) so that `Append` and `RelativePath` can operate on simple
//! segment vectors.

use std::fmt;

/// A parsed, normalized URN.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Urn {
    scheme: String,
    domain: String,
    /// Always `""` or starting with `/`, with `.`/`..` already collapsed.
    path: String,
    fragment: String,
}

/// The parsed components of a URN, as returned by [`Urn::parse`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UriComponents {
    pub scheme: String,
    pub domain: String,
    pub path: String,
    pub fragment: String,
}

fn normalize_segments(input: &str) -> Vec<String> {
    let mut segments: Vec<String> = Vec::new();
    for token in input.split('/') {
        match token {
            "" | "." => continue,
            ".." => {
                segments.pop();
            }
            other => segments.push(other.to_string()),
        }
    }
    segments
}

fn segments_to_path(segments: &[String]) -> String {
    if segments.is_empty() {
        String::new()
    } else {
        format!("/{}", segments.join("/"))
    }
}

impl Urn {
    /// Parses `value` into a normalized URN, applying the filesystem-path
    /// fallback when no `scheme:` prefix is present.
    pub fn new(value: &str) -> Self {
        if value.is_empty() {
            return Urn::default();
        }

        if let Some(idx) = value.find("://") {
            let scheme = value[..idx].to_string();
            let rest = &value[idx + 3..];
            let (domain, remainder) = match rest.find('/') {
                Some(p) => (rest[..p].to_string(), &rest[p..]),
                None => (rest.to_string(), ""),
            };
            let (path_part, fragment) = match remainder.find('#') {
                Some(p) => (&remainder[..p], remainder[p + 1..].to_string()),
                None => (remainder, String::new()),
            };
            let path = segments_to_path(&normalize_segments(path_part));
            return Urn {
                scheme,
                domain,
                path,
                fragment,
            };
        }

        if let Some(idx) = value.find(':') {
            let scheme = value[..idx].to_string();
            let rest = &value[idx + 1..];
            let (rest, fragment) = match rest.find('#') {
                Some(p) => (&rest[..p], rest[p + 1..].to_string()),
                None => (rest, String::new()),
            };
            let path = segments_to_path(&normalize_segments(rest));
            return Urn {
                scheme,
                domain: String::new(),
                path,
                fragment,
            };
        }

        // Bare filesystem path: normalize to file:///absolute/path.
        Urn {
            scheme: "file".to_string(),
            domain: String::new(),
            path: segments_to_path(&normalize_segments(value)),
            fragment: String::new(),
        }
    }

    /// Builds a `file://` URN from a filesystem path, the way the
    /// reference implementation's `NewURNFromFilename` does.
    pub fn from_filename(path: &str) -> Self {
        Urn::new(path)
    }

    pub fn parse(&self) -> UriComponents {
        UriComponents {
            scheme: self.scheme.clone(),
            domain: self.domain.clone(),
            path: self.path.clone(),
            fragment: self.fragment.clone(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn fragment(&self) -> &str {
        &self.fragment
    }

    pub fn serialize(&self) -> String {
        if self.scheme.is_empty() && self.domain.is_empty() && self.path.is_empty() {
            return String::new();
        }
        let frag = if self.fragment.is_empty() {
            String::new()
        } else {
            format!("#{}", self.fragment)
        };
        format!("{}://{}{}{}", self.scheme, self.domain, self.path, frag)
    }

    /// Appends `suffix` as a path, collapsing `.`/`..` against the
    /// current path. `..` past the root is idempotent.
    pub fn append(&self, suffix: &str) -> Urn {
        let mut segments = normalize_segments(&self.path);
        for token in suffix.split('/') {
            match token {
                "" | "." => continue,
                ".." => {
                    segments.pop();
                }
                other => segments.push(other.to_string()),
            }
        }
        Urn {
            scheme: self.scheme.clone(),
            domain: self.domain.clone(),
            path: segments_to_path(&segments),
            fragment: self.fragment.clone(),
        }
    }

    /// `true` if `child` shares this URN's scheme+domain and its path
    /// segments begin with this URN's path segments.
    pub fn is_ancestor_of(&self, child: &Urn) -> bool {
        if self.scheme != child.scheme || self.domain != child.domain {
            return false;
        }
        let parent_segs = normalize_segments(&self.path);
        let child_segs = normalize_segments(&child.path);
        child_segs.len() >= parent_segs.len() && child_segs[..parent_segs.len()] == parent_segs[..]
    }

    /// Returns the child's tail beyond this URN's tail, or the child's
    /// full serialization when it is not a descendant.
    pub fn relative_path(&self, child: &Urn) -> String {
        if !self.is_ancestor_of(child) {
            return child.serialize();
        }
        let parent_segs = normalize_segments(&self.path);
        let child_segs = normalize_segments(&child.path);
        segments_to_path(&child_segs[parent_segs.len()..])
    }
}

impl From<&str> for Urn {
    fn from(value: &str) -> Self {
        Urn::new(value)
    }
}

impl From<String> for Urn {
    fn from(value: String) -> Self {
        Urn::new(&value)
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_url() {
        let url = "http://www.google.com/path/to/element#hash_data";
        let u = Urn::new(url);
        let c = u.parse();
        assert_eq!(c.scheme, "http");
        assert_eq!(c.domain, "www.google.com");
        assert_eq!(c.path, "/path/to/element");
        assert_eq!(c.fragment, "hash_data");
        assert_eq!(u.serialize(), url);
    }

    #[test]
    fn serialize_roundtrip_simple_forms() {
        for url in [
            "http://www.google.com/path/to/element",
            "http://www.google.com",
            "ftp://www.google.com",
            "",
        ] {
            assert_eq!(Urn::new(url).serialize(), url);
        }
    }

    #[test]
    fn filesystem_path_normalization() {
        assert_eq!(Urn::new("/etc/passwd").serialize(), "file:///etc/passwd");
        assert_eq!(Urn::new("etc/passwd").serialize(), "file:///etc/passwd");
    }

    #[test]
    fn scheme_without_authority() {
        assert_eq!(
            Urn::new("http:www.google.com").serialize(),
            "http:///www.google.com"
        );
        assert_eq!(
            Urn::new("http:/www.google.com").serialize(),
            "http:///www.google.com"
        );
    }

    #[test]
    fn append_collapses_dot_segments() {
        let test = Urn::new("http://www.google.com");
        assert_eq!(
            test.append("foobar").serialize(),
            "http://www.google.com/foobar"
        );
        assert_eq!(
            test.append("/foobar").serialize(),
            "http://www.google.com/foobar"
        );
        assert_eq!(test.append("..").serialize(), "http://www.google.com");
        assert_eq!(
            test.append("../../../..").serialize(),
            "http://www.google.com"
        );
        assert_eq!(
            test.append("aa/bb/../..").serialize(),
            "http://www.google.com"
        );
        assert_eq!(
            test.append("aa//../c").serialize(),
            "http://www.google.com/c"
        );
        assert_eq!(
            test.append("aa///////////.///./c").serialize(),
            "http://www.google.com/aa/c"
        );
    }

    #[test]
    fn relative_path_strips_dot_segments() {
        let parent = Urn::new("aff4://e21659ea-c7d6-4f4d-8070-919178aa4c7b");
        let child = Urn::new(
            "aff4://e21659ea-c7d6-4f4d-8070-919178aa4c7b/bin/../bin/ls/00000000/index",
        );
        assert_eq!(parent.relative_path(&child), "/bin/ls/00000000/index");
    }

    #[test]
    fn relative_path_of_non_descendant_is_full_serialization() {
        let a = Urn::new("aff4://aaaa");
        let b = Urn::new("aff4://bbbb/x");
        assert_eq!(a.relative_path(&b), b.serialize());
    }
}
