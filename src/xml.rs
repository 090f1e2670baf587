//! Minimal scanner for the legacy XML data files (accounts, items, world).
//!
//! The files are machine-written, flat, and predate namespaces, CDATA and
//! entities beyond the basic five, so a small forgiving tokenizer is enough.
//! Unknown elements and attributes pass through untouched for callers to
//! ignore.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlEvent {
    /// `<name attr="value" ...>`; `self_closing` when the tag ends in `/>`.
    Open {
        name: String,
        attributes: Vec<(String, String)>,
        self_closing: bool,
    },
    /// `</name>`
    Close { name: String },
}

pub struct XmlScanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> XmlScanner<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    /// Next tag event, skipping text, comments and processing instructions.
    pub fn next_event(&mut self) -> Option<XmlEvent> {
        loop {
            let open = self.rest().find('<')?;
            self.pos += open + 1;

            if self.rest().starts_with("!--") {
                let end = self.rest().find("-->")?;
                self.pos += end + 3;
                continue;
            }
            if self.rest().starts_with('?') || self.rest().starts_with('!') {
                let end = self.rest().find('>')?;
                self.pos += end + 1;
                continue;
            }

            let end = self.rest().find('>')?;
            let tag = &self.rest()[..end];
            self.pos += end + 1;

            if let Some(name) = tag.strip_prefix('/') {
                return Some(XmlEvent::Close {
                    name: name.trim().to_string(),
                });
            }

            let self_closing = tag.ends_with('/');
            let tag = tag.strip_suffix('/').unwrap_or(tag).trim();
            let (name, attr_text) = match tag.find(char::is_whitespace) {
                Some(split) => (&tag[..split], &tag[split..]),
                None => (tag, ""),
            };
            return Some(XmlEvent::Open {
                name: name.to_string(),
                attributes: parse_attributes(attr_text),
                self_closing,
            });
        }
    }
}

fn parse_attributes(text: &str) -> Vec<(String, String)> {
    let mut attributes = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && (bytes[i] as char).is_whitespace() {
            i += 1;
        }
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' && !(bytes[i] as char).is_whitespace() {
            i += 1;
        }
        if key_start == i {
            break;
        }
        let key = text[key_start..i].to_string();
        while i < bytes.len() && (bytes[i] as char).is_whitespace() {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != b'=' {
            continue;
        }
        i += 1;
        while i < bytes.len() && (bytes[i] as char).is_whitespace() {
            i += 1;
        }
        if i >= bytes.len() || (bytes[i] != b'"' && bytes[i] != b'\'') {
            continue;
        }
        let quote = bytes[i];
        i += 1;
        let value_start = i;
        while i < bytes.len() && bytes[i] != quote {
            i += 1;
        }
        let value = unescape(&text[value_start..i]);
        if i < bytes.len() {
            i += 1;
        }
        attributes.push((key, value));
    }
    attributes
}

fn unescape(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Convenience lookup on an attribute list.
pub fn attribute<'a>(attributes: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}
