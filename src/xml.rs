use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::error::IngestError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlContent {
    Element(XmlNode),
    Text(String),
}

/// Owned element tree built from quick-xml events. NCBI responses are a few
/// megabytes at most, so holding a batch in memory is fine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlNode {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub content: Vec<XmlContent>,
}

impl XmlNode {
    /// Parses a document and returns a synthetic root whose children are the
    /// top-level elements.
    pub fn parse(xml: &str) -> Result<XmlNode, IngestError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut stack = vec![XmlNode {
            name: "#document".to_string(),
            ..XmlNode::default()
        }];

        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) => stack.push(element_from(e)?),
                Ok(Event::Empty(ref e)) => {
                    let node = element_from(e)?;
                    push_child(&mut stack, XmlContent::Element(node));
                }
                Ok(Event::End(_)) => {
                    if stack.len() < 2 {
                        return Err(IngestError::Xml("unbalanced end tag".to_string()));
                    }
                    if let Some(node) = stack.pop() {
                        push_child(&mut stack, XmlContent::Element(node));
                    }
                }
                Ok(Event::Text(ref e)) => {
                    let text = match e.unescape() {
                        Ok(text) => text.into_owned(),
                        Err(_) => String::from_utf8_lossy(e).into_owned(),
                    };
                    push_child(&mut stack, XmlContent::Text(text));
                }
                Ok(Event::CData(e)) => {
                    let text = String::from_utf8_lossy(&e.into_inner()).into_owned();
                    push_child(&mut stack, XmlContent::Text(text));
                }
                Ok(Event::Eof) => break,
                Err(err) => {
                    return Err(IngestError::Xml(format!(
                        "at byte {}: {err}",
                        reader.buffer_position()
                    )));
                }
                _ => {}
            }
        }

        if stack.len() != 1 {
            return Err(IngestError::Xml("unexpected end of document".to_string()));
        }
        stack
            .pop()
            .ok_or_else(|| IngestError::Xml("empty document".to_string()))
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn children(&self) -> impl Iterator<Item = &XmlNode> {
        self.content.iter().filter_map(|item| match item {
            XmlContent::Element(node) => Some(node),
            XmlContent::Text(_) => None,
        })
    }

    pub fn children_named<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a XmlNode> {
        self.children().filter(move |node| node.name == name)
    }

    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children_named(name).next()
    }

    /// Follows a `/`-separated path of child names, taking the first match at
    /// each step.
    pub fn find(&self, path: &str) -> Option<&XmlNode> {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(self, |node, segment| node.child(segment))
    }

    /// Every node reachable through a `/`-separated path of child names.
    pub fn find_all(&self, path: &str) -> Vec<&XmlNode> {
        let mut current = vec![self];
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            current = current
                .into_iter()
                .flat_map(|node| node.children_named(segment))
                .collect();
        }
        current
    }

    /// Depth-first search for elements with the given name at any depth.
    pub fn descendants(&self, name: &str) -> Vec<&XmlNode> {
        let mut found = Vec::new();
        self.collect_descendants(name, &mut found);
        found
    }

    fn collect_descendants<'a>(&'a self, name: &str, found: &mut Vec<&'a XmlNode>) {
        for child in self.children() {
            if child.name == name {
                found.push(child);
            }
            child.collect_descendants(name, found);
        }
    }

    /// Concatenated text of this node and its descendants, whitespace collapsed.
    pub fn text(&self) -> String {
        let mut raw = String::new();
        self.collect_text(&mut raw);
        raw.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn collect_text(&self, out: &mut String) {
        for item in &self.content {
            match item {
                XmlContent::Text(text) => out.push_str(text),
                XmlContent::Element(node) => node.collect_text(out),
            }
        }
    }

    pub fn find_text(&self, path: &str) -> Option<String> {
        self.find(path)
            .map(XmlNode::text)
            .filter(|text| !text.is_empty())
    }
}

fn element_from(start: &BytesStart<'_>) -> Result<XmlNode, IngestError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|err| IngestError::Xml(err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| IngestError::Xml(err.to_string()))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(XmlNode {
        name,
        attributes,
        content: Vec::new(),
    })
}

fn push_child(stack: &mut [XmlNode], item: XmlContent) {
    if let Some(parent) = stack.last_mut() {
        parent.content.push(item);
    }
}
