//! In-memory XMLTV document tree.
//!
//! Documents are parsed into a generic element tree so that every child of the
//! source root survives the merge untouched, including elements this crate has
//! no typed view for. [`Channel`] and [`Programme`] are read-only views over
//! the two element kinds the merge cares about.

use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use encoding_rs::{Encoding, UTF_8};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

/// Root element name of an XMLTV document.
pub const XMLTV_ROOT: &str = "tv";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

/// The element kinds the merge distinguishes between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Channel,
    Programme,
    Other,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn first_child(&self, name: &str) -> Option<&Element> {
        self.child_elements().find(|e| e.name == name)
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    pub fn kind(&self) -> ElementKind {
        match self.name.as_str() {
            "channel" => ElementKind::Channel,
            "programme" => ElementKind::Programme,
            _ => ElementKind::Other,
        }
    }
}

/// A `<channel>` element: identity plus display names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    pub display_names: Vec<String>,
}

impl Channel {
    pub fn from_element(element: &Element) -> Option<Self> {
        if element.kind() != ElementKind::Channel {
            return None;
        }
        Some(Self {
            id: element.attribute("id").unwrap_or_default().to_string(),
            display_names: element
                .child_elements()
                .filter(|e| e.name == "display-name")
                .map(Element::text)
                .collect(),
        })
    }
}

/// A `<programme>` element.
///
/// `start`/`stop` hold the parsed timestamps when the raw attribute is a valid
/// XMLTV time; the raw strings are kept regardless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Programme {
    pub channel: String,
    pub start_raw: String,
    pub stop_raw: String,
    pub start: Option<DateTime<FixedOffset>>,
    pub stop: Option<DateTime<FixedOffset>>,
    pub title: Option<String>,
    pub sub_title: Option<String>,
    pub description: Option<String>,
}

impl Programme {
    pub fn from_element(element: &Element) -> Option<Self> {
        if element.kind() != ElementKind::Programme {
            return None;
        }
        let start_raw = element.attribute("start").unwrap_or_default().to_string();
        let stop_raw = element.attribute("stop").unwrap_or_default().to_string();
        let child_text = |name: &str| element.first_child(name).map(Element::text);
        Some(Self {
            channel: element.attribute("channel").unwrap_or_default().to_string(),
            start: parse_xmltv_time(&start_raw),
            stop: parse_xmltv_time(&stop_raw),
            start_raw,
            stop_raw,
            title: child_text("title"),
            sub_title: child_text("sub-title"),
            // Generated guides in the wild use <description> instead of <desc>.
            description: child_text("desc").or_else(|| child_text("description")),
        })
    }

    /// False only when both timestamps parse and start is after stop.
    pub fn is_well_ordered(&self) -> bool {
        match (self.start, self.stop) {
            (Some(start), Some(stop)) => start <= stop,
            _ => true,
        }
    }
}

/// Parses an XMLTV timestamp: `YYYYMMDDhhmmss +zzzz`, or the same without an
/// offset (read as UTC).
pub fn parse_xmltv_time(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y%m%d%H%M%S %z") {
        return Some(dt);
    }
    let digits = raw.get(..14)?;
    NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| naive.and_utc().fixed_offset())
}

#[derive(Debug)]
pub enum DocumentError {
    Xml(String),
    Utf8(String),
    Encoding(String),
    NoRoot,
    MultipleRoots,
    Write(String),
}

impl DocumentError {
    fn write_failed<E: fmt::Display>(e: E) -> Self {
        DocumentError::Write(e.to_string())
    }
}

impl fmt::Display for DocumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentError::Xml(msg) => write!(f, "malformed XML: {msg}"),
            DocumentError::Utf8(msg) => write!(f, "invalid UTF-8 in markup: {msg}"),
            DocumentError::Encoding(msg) => write!(f, "unsupported or invalid encoding: {msg}"),
            DocumentError::NoRoot => write!(f, "document has no root element"),
            DocumentError::MultipleRoots => write!(f, "document has more than one root element"),
            DocumentError::Write(msg) => write!(f, "failed to serialise document: {msg}"),
        }
    }
}

impl std::error::Error for DocumentError {}

/// A parsed document with a single root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub root: Element,
}

impl Document {
    pub fn new(root_name: &str) -> Self {
        Self {
            root: Element::new(root_name),
        }
    }

    /// Parses a document. Input in another encoding, named by a BOM or the XML
    /// declaration, is decoded first; the tree always holds UTF-8 text.
    pub fn parse(bytes: &[u8]) -> Result<Self, DocumentError> {
        let utf8 = to_utf8(bytes)?;
        let mut reader = Reader::from_reader(utf8.as_ref());
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => {
                    if stack.is_empty() && root.is_some() {
                        return Err(DocumentError::MultipleRoots);
                    }
                    stack.push(element_from_start(&e)?);
                }
                Ok(Event::Empty(e)) => {
                    let element = element_from_start(&e)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| DocumentError::Xml("unexpected closing tag".into()))?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::Text(t)) => {
                    if let Some(parent) = stack.last_mut() {
                        let text = t
                            .unescape()
                            .map_err(|e| DocumentError::Xml(e.to_string()))?;
                        if !text.is_empty() {
                            parent.children.push(Node::Text(text.into_owned()));
                        }
                    }
                }
                Ok(Event::CData(c)) => {
                    if let Some(parent) = stack.last_mut() {
                        parent
                            .children
                            .push(Node::Text(String::from_utf8_lossy(&c).into_owned()));
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(DocumentError::Xml(format!(
                        "{e} (at byte {})",
                        reader.buffer_position()
                    )))
                }
            }
            buf.clear();
        }

        if let Some(open) = stack.last() {
            return Err(DocumentError::Xml(format!(
                "unclosed element <{}>",
                open.name
            )));
        }
        root.map(|root| Document { root }).ok_or(DocumentError::NoRoot)
    }

    /// Serialises with an XML declaration and two-space indentation.
    pub fn to_xml_bytes(&self) -> Result<Vec<u8>, DocumentError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(DocumentError::write_failed)?;
        write_element(&mut writer, &self.root)?;
        let mut bytes = writer.into_inner();
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.root.child_elements().filter_map(Channel::from_element)
    }

    pub fn programmes(&self) -> impl Iterator<Item = Programme> + '_ {
        self.root.child_elements().filter_map(Programme::from_element)
    }
}

fn to_utf8(bytes: &[u8]) -> Result<Cow<'_, [u8]>, DocumentError> {
    let (encoding, body) = match Encoding::for_bom(bytes) {
        Some((encoding, bom_len)) => (encoding, &bytes[bom_len..]),
        None => match declared_encoding(bytes) {
            Some(label) => {
                let encoding = Encoding::for_label(label.as_bytes())
                    .ok_or_else(|| DocumentError::Encoding(label.to_string()))?;
                (encoding, bytes)
            }
            None => (UTF_8, bytes),
        },
    };
    if encoding == UTF_8 {
        return Ok(Cow::Borrowed(bytes));
    }
    let (text, had_errors) = encoding.decode_without_bom_handling(body);
    if had_errors {
        return Err(DocumentError::Encoding(format!(
            "malformed {} input",
            encoding.name()
        )));
    }
    Ok(Cow::Owned(text.into_owned().into_bytes()))
}

/// Label from a leading `<?xml ... encoding="..."?>` declaration.
fn declared_encoding(bytes: &[u8]) -> Option<&str> {
    let rest = bytes.strip_prefix(b"<?xml")?;
    let head = &rest[..rest.len().min(256)];
    let end = head.windows(2).position(|w| w == b"?>")?;
    let decl = std::str::from_utf8(&head[..end]).ok()?;
    let after = &decl[decl.find("encoding")? + "encoding".len()..];
    let after = after.trim_start().strip_prefix('=')?.trim_start();
    let quote = after.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let value = &after[1..];
    value.find(quote).map(|end| &value[..end])
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element, DocumentError> {
    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(|e| DocumentError::Utf8(e.to_string()))?
        .to_string();
    let mut element = Element::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| DocumentError::Xml(e.to_string()))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| DocumentError::Utf8(e.to_string()))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| DocumentError::Xml(e.to_string()))?
            .into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), DocumentError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(Node::Element(element));
        return Ok(());
    }
    if root.is_some() {
        return Err(DocumentError::MultipleRoots);
    }
    *root = Some(element);
    Ok(())
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> Result<(), DocumentError> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    if element.children.is_empty() {
        return writer
            .write_event(Event::Empty(start))
            .map_err(DocumentError::write_failed);
    }
    writer
        .write_event(Event::Start(start))
        .map_err(DocumentError::write_failed)?;
    for child in &element.children {
        match child {
            Node::Element(e) => write_element(writer, e)?,
            Node::Text(t) => writer
                .write_event(Event::Text(BytesText::new(t)))
                .map_err(DocumentError::write_failed)?,
        }
    }
    writer
        .write_event(Event::End(BytesEnd::new(element.name.as_str())))
        .map_err(DocumentError::write_failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tv generator-info-name="none">
  <channel id="CITYNEWS247">
    <display-name lang="en">City News 24/7</display-name>
  </channel>
  <programme start="20250206120000 +0000" stop="20250206130000 +0000" channel="CITYNEWS247">
    <title lang="en">Show &amp; Tell</title>
    <sub-title>Pilot</sub-title>
    <desc>First episode</desc>
  </programme>
</tv>
"#;

    #[test]
    fn parses_channels_and_programmes() {
        let doc = Document::parse(SAMPLE.as_bytes()).expect("sample parses");
        assert_eq!(doc.root.name, "tv");
        assert_eq!(doc.root.attribute("generator-info-name"), Some("none"));

        let channels: Vec<_> = doc.channels().collect();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].id, "CITYNEWS247");
        assert_eq!(channels[0].display_names, vec!["City News 24/7"]);

        let programmes: Vec<_> = doc.programmes().collect();
        assert_eq!(programmes.len(), 1);
        let p = &programmes[0];
        assert_eq!(p.channel, "CITYNEWS247");
        assert_eq!(p.title.as_deref(), Some("Show & Tell"));
        assert_eq!(p.sub_title.as_deref(), Some("Pilot"));
        assert_eq!(p.description.as_deref(), Some("First episode"));
        assert!(p.start.is_some() && p.stop.is_some());
        assert!(p.is_well_ordered());
    }

    #[test]
    fn serialised_output_reparses_to_same_tree() {
        let doc = Document::parse(SAMPLE.as_bytes()).unwrap();
        let bytes = doc.to_xml_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?>"#));
        assert!(text.contains("<title lang=\"en\">Show &amp; Tell</title>"));
        assert_eq!(Document::parse(&bytes).unwrap(), doc);
    }

    #[test]
    fn rejects_malformed_and_rootless_input() {
        assert!(matches!(
            Document::parse(b"<tv><channel></tv>"),
            Err(DocumentError::Xml(_))
        ));
        assert!(matches!(
            Document::parse(b"<tv><channel id=\"a\">"),
            Err(DocumentError::Xml(_))
        ));
        assert!(matches!(
            Document::parse(b"<?xml version=\"1.0\"?>"),
            Err(DocumentError::NoRoot)
        ));
        assert!(matches!(
            Document::parse(b"<tv/><tv/>"),
            Err(DocumentError::MultipleRoots)
        ));
    }

    #[test]
    fn latin1_guide_is_decoded_from_its_declaration() {
        let doc = Document::parse(
            b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?>\
              <tv><channel id=\"caf\xE9\"><display-name>T\xE9l\xE9</display-name></channel></tv>",
        )
        .expect("latin-1 guide parses");

        let channels: Vec<_> = doc.channels().collect();
        assert_eq!(channels[0].id, "caf\u{e9}");
        assert_eq!(channels[0].display_names, vec!["T\u{e9}l\u{e9}"]);

        let text = String::from_utf8(doc.to_xml_bytes().unwrap()).unwrap();
        assert!(text.contains("T\u{e9}l\u{e9}"));
    }

    #[test]
    fn utf8_bom_and_unknown_encodings() {
        let bom = b"\xEF\xBB\xBF<?xml version=\"1.0\" encoding=\"UTF-8\"?><tv/>";
        assert_eq!(Document::parse(bom).unwrap().root.name, "tv");

        assert!(matches!(
            Document::parse(b"<?xml version='1.0' encoding='x-made-up'?><tv/>"),
            Err(DocumentError::Encoding(_))
        ));
    }

    #[test]
    fn xmltv_time_accepts_missing_offset() {
        let with_offset = parse_xmltv_time("20250206120000 +0100").unwrap();
        let without = parse_xmltv_time("20250206110000").unwrap();
        assert_eq!(with_offset, without);
        assert!(parse_xmltv_time("yesterday").is_none());
    }

    #[test]
    fn reversed_programme_is_not_well_ordered() {
        let element = Element::new("programme")
            .with_attribute("start", "20250206130000 +0000")
            .with_attribute("stop", "20250206120000 +0000")
            .with_attribute("channel", "x");
        let p = Programme::from_element(&element).unwrap();
        assert!(!p.is_well_ordered());

        let unparsable = Element::new("programme")
            .with_attribute("start", "soon")
            .with_attribute("stop", "later");
        assert!(Programme::from_element(&unparsable).unwrap().is_well_ordered());
    }
}
