//! Naming paths (distinguished names) for directory entries
//!
//! Values are escaped with a backslash before every structurally
//! significant character. Parsing accepts both `\X` and RFC 4514 `\HH`
//! hex escapes, so paths written by other directory tools decode too.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{OumanError, Result};

/// Upper bound for a single naming value, in characters
pub const MAX_VALUE_LENGTH: usize = 255;

/// Characters that carry meaning inside a naming path
pub const RISKY_CHARS: [char; 10] = ['\\', ',', '"', '/', '<', '>', ';', '=', '+', '#'];

/// Escape a raw value for use inside a naming path component.
///
/// Leading and trailing whitespace is stripped first.
pub fn escape_value(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut escaped = String::with_capacity(trimmed.len() * 2);

    for ch in trimmed.chars() {
        if RISKY_CHARS.contains(&ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }

    escaped
}

/// Syntactic gate for values that end up in a naming path.
///
/// Independent of escaping: a value passing this check may still contain
/// risky characters, which `escape_value` then neutralizes.
pub fn is_valid_value(value: &str) -> bool {
    if value.trim().is_empty() {
        return false;
    }
    if value.chars().count() > MAX_VALUE_LENGTH {
        return false;
    }
    !value.chars().any(|c| (c as u32) < 0x20 || c == '\x7f')
}

pub fn has_risky_chars(value: &str) -> bool {
    value.chars().any(|c| RISKY_CHARS.contains(&c))
}

pub fn list_risky_chars(value: &str) -> BTreeSet<char> {
    value.chars().filter(|c| RISKY_CHARS.contains(c)).collect()
}

/// `uid=<uid>,ou=<ou>,<base>`
///
/// Does not validate; callers check both values with [`is_valid_value`] first.
pub fn build_entry_path(uid: &str, ou: &str, base: &str) -> String {
    format!("uid={},ou={},{}", escape_value(uid), escape_value(ou), base)
}

/// `ou=<ou>,<base>`
pub fn build_ou_path(ou: &str, base: &str) -> String {
    format!("ou={},{}", escape_value(ou), base)
}

/// One `attribute=value` component of a naming path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rdn {
    pub attribute: String,
    pub value: String,
}

impl Rdn {
    pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn is(&self, attribute: &str) -> bool {
        self.attribute.eq_ignore_ascii_case(attribute)
    }
}

impl PartialEq for Rdn {
    fn eq(&self, other: &Self) -> bool {
        self.attribute.eq_ignore_ascii_case(&other.attribute)
            && self.value.to_lowercase() == other.value.to_lowercase()
    }
}

impl Eq for Rdn {}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.attribute, escape_value(&self.value))
    }
}

/// Ordered sequence of components, leaf first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NamingPath {
    components: Vec<Rdn>,
}

impl NamingPath {
    pub fn new(components: Vec<Rdn>) -> Result<Self> {
        if components.is_empty() {
            return Err(OumanError::malformed_path("", "path has no components"));
        }
        Ok(Self { components })
    }

    /// Parse a textual path into typed components
    pub fn parse(input: &str) -> Result<Self> {
        let mut components = Vec::new();
        let mut parser = ComponentParser::new(input);

        while let Some(raw) = parser.next_component()? {
            let (attribute, value) = raw;
            if attribute.is_empty() {
                return Err(OumanError::malformed_path(input, "empty attribute name"));
            }
            components.push(Rdn { attribute, value });
        }

        if components.is_empty() {
            return Err(OumanError::malformed_path(input, "path has no components"));
        }
        Ok(Self { components })
    }

    pub fn for_entry(uid: &str, ou: &str, base: &str) -> Result<Self> {
        Self::parse(&build_entry_path(uid, ou, base))
    }

    pub fn for_ou(ou: &str, base: &str) -> Result<Self> {
        Self::parse(&build_ou_path(ou, base))
    }

    pub fn components(&self) -> &[Rdn] {
        &self.components
    }

    /// The entry-specific first component; immutable once the entry exists
    pub fn leaf(&self) -> &Rdn {
        &self.components[0]
    }

    /// Value of the first `ou` component, if any
    pub fn ou(&self) -> Option<&str> {
        self.components
            .iter()
            .find(|rdn| rdn.is("ou"))
            .map(|rdn| rdn.value.as_str())
    }

    /// Path without the leaf component
    pub fn parent(&self) -> Option<NamingPath> {
        if self.components.len() < 2 {
            return None;
        }
        Some(Self {
            components: self.components[1..].to_vec(),
        })
    }

    pub fn is_under(&self, base: &NamingPath) -> bool {
        self.components.len() > base.components.len()
            && self.components.ends_with(&base.components)
    }

    /// Case-insensitive key usable for map lookups
    pub fn normalized(&self) -> String {
        self.components
            .iter()
            .map(|rdn| {
                format!(
                    "{}={}",
                    rdn.attribute.to_lowercase(),
                    escape_value(&rdn.value.to_lowercase())
                )
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for NamingPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", rdn)?;
        }
        Ok(())
    }
}

impl FromStr for NamingPath {
    type Err = OumanError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NamingPath {
    type Error = OumanError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<NamingPath> for String {
    fn from(path: NamingPath) -> Self {
        path.to_string()
    }
}

struct ComponentParser<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    finished: bool,
}

impl<'a> ComponentParser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.chars().peekable(),
            finished: input.trim().is_empty(),
        }
    }

    fn next_component(&mut self) -> Result<Option<(String, String)>> {
        if self.finished {
            return Ok(None);
        }

        let mut attribute = String::new();
        loop {
            match self.chars.next() {
                Some('=') => break,
                Some(',') | None => {
                    return Err(OumanError::malformed_path(
                        self.input,
                        "component is missing '='",
                    ))
                }
                Some(c) => attribute.push(c),
            }
        }

        // Collected as bytes so multi-byte hex escapes decode to UTF-8.
        let mut value: Vec<u8> = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            match self.chars.next() {
                Some(',') => break,
                None => {
                    self.finished = true;
                    break;
                }
                Some('\\') => self.read_escape(&mut value)?,
                Some(c) => value.extend_from_slice(c.encode_utf8(&mut buf).as_bytes()),
            }
        }

        let value = String::from_utf8(value).map_err(|_| {
            OumanError::malformed_path(self.input, "escaped bytes are not valid UTF-8")
        })?;

        Ok(Some((attribute.trim().to_string(), value.trim().to_string())))
    }

    fn read_escape(&mut self, value: &mut Vec<u8>) -> Result<()> {
        let first = self.chars.next().ok_or_else(|| {
            OumanError::malformed_path(self.input, "dangling escape at end of path")
        })?;

        if first.is_ascii_hexdigit() {
            if let Some(&second) = self.chars.peek() {
                if second.is_ascii_hexdigit() {
                    self.chars.next();
                    let byte = u8::from_str_radix(&format!("{}{}", first, second), 16)
                        .map_err(|_| OumanError::malformed_path(self.input, "bad hex escape"))?;
                    value.push(byte);
                    return Ok(());
                }
            }
        }

        let mut buf = [0u8; 4];
        value.extend_from_slice(first.encode_utf8(&mut buf).as_bytes());
        Ok(())
    }
}
