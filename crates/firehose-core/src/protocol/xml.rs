//! Firehose XML command construction and response scanning.
//!
//! The Firehose dialect is flat: every frame is `<?xml ...?><data>` wrapping
//! one or more attribute-only elements (`<response .../>`, `<log .../>`,
//! `<configure .../>`, ...). There is no nesting and no text content, so the
//! frames are built and scanned directly rather than through a full XML
//! library.

use std::fmt::Display;

/// Builder for one outgoing Firehose command frame.
///
/// ```
/// use firehose_core::protocol::xml::CommandBuilder;
///
/// let xml = CommandBuilder::new("power").attr("value", "reset").build();
/// assert_eq!(xml, "<?xml version=\"1.0\" ?><data><power value=\"reset\" /></data>");
/// ```
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    name: &'static str,
    attrs: Vec<(String, String)>,
}

impl CommandBuilder {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            attrs: Vec::new(),
        }
    }

    /// Append an attribute. Order is preserved; some loaders are picky about it.
    pub fn attr(mut self, name: &str, value: impl Display) -> Self {
        self.attrs.push((name.to_string(), value.to_string()));
        self
    }

    pub fn build(self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" ?><data><");
        out.push_str(self.name);
        for (name, value) in &self.attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(value);
            out.push('"');
        }
        out.push_str(" /></data>");
        out
    }
}

/// One scanned element: tag name plus attributes in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
}

impl Element {
    /// Case-insensitive attribute lookup.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Scan every element in a packet, tolerating device log noise before the
/// `<data` tag and junk between elements. The `<?xml?>` declaration and
/// closing tags are skipped.
pub fn scan_elements(packet: &str) -> Vec<Element> {
    let bytes = packet.as_bytes();
    let mut elements = Vec::new();
    let mut pos = 0;

    while let Some(open) = find_byte(bytes, pos, b'<') {
        pos = open + 1;
        if pos >= bytes.len() {
            break;
        }
        // Skip declarations and closing tags.
        if bytes[pos] == b'?' || bytes[pos] == b'/' || bytes[pos] == b'!' {
            continue;
        }

        let name_start = pos;
        while pos < bytes.len() && is_name_byte(bytes[pos]) {
            pos += 1;
        }
        if pos == name_start {
            continue;
        }
        let name = packet[name_start..pos].to_string();

        let mut attrs = Vec::new();
        loop {
            while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            if pos >= bytes.len() || bytes[pos] == b'>' || bytes[pos] == b'/' {
                // Advance past the tag end so the next scan starts cleanly.
                if let Some(end) = find_byte(bytes, pos, b'>') {
                    pos = end + 1;
                }
                break;
            }

            let attr_start = pos;
            while pos < bytes.len() && is_name_byte(bytes[pos]) {
                pos += 1;
            }
            if pos == attr_start {
                pos += 1;
                continue;
            }
            let attr_name = packet[attr_start..pos].to_string();

            while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            if pos >= bytes.len() || bytes[pos] != b'=' {
                continue;
            }
            pos += 1;
            while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            if pos >= bytes.len() || (bytes[pos] != b'"' && bytes[pos] != b'\'') {
                continue;
            }
            let quote = bytes[pos];
            pos += 1;
            let val_start = pos;
            while pos < bytes.len() && bytes[pos] != quote {
                pos += 1;
            }
            if pos >= bytes.len() {
                break;
            }
            attrs.push((attr_name, packet[val_start..pos].to_string()));
            pos += 1;
        }

        elements.push(Element { name, attrs });
    }

    elements
}

fn find_byte(haystack: &[u8], from: usize, needle: u8) -> Option<usize> {
    haystack[from.min(haystack.len())..]
        .iter()
        .position(|&b| b == needle)
        .map(|i| i + from)
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b':'
}
