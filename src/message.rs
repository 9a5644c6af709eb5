//! Composition and parsing helpers for the element-only XML dialect the
//! upstream speaks. Messages are rooted at `<xml>` and carry no
//! attributes, so serialization is a flat builder and parsing goes
//! through `roxmltree`.

use std::fmt::Display;

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Builds one outbound message with the standard header/source/target
/// preamble.
pub struct MsgBuilder {
    buf: String,
}

impl MsgBuilder {
    pub fn new(header: &str, source: &str, target: &str) -> Self {
        let mut buf = String::from("<xml>");
        push_element(&mut buf, "header", header);
        push_element(&mut buf, "source", source);
        push_element(&mut buf, "target", target);
        Self { buf }
    }

    pub fn field(mut self, name: &str, value: &str) -> Self {
        push_element(&mut self.buf, name, value);
        self
    }

    /// Appends an already-serialized fragment, e.g. a `<where>` filter.
    pub fn fragment(mut self, xml: &str) -> Self {
        self.buf.push_str(xml);
        self
    }

    pub fn finish(mut self) -> String {
        self.buf.push_str("</xml>");
        self.buf
    }
}

fn push_element(buf: &mut String, name: &str, value: &str) {
    buf.push('<');
    buf.push_str(name);
    buf.push('>');
    buf.push_str(&escape(value));
    buf.push_str("</");
    buf.push_str(name);
    buf.push('>');
}

/// Synthesizes the error envelope the reply shaper turns into `! <msg>`.
/// Used for ask failures so callers see exactly one reply shape.
pub fn error_reply(source: &str, msg: &dyn Display) -> String {
    MsgBuilder::new("answer", source, "CONSOLE")
        .field("answer1", "1")
        .field("error_string", &msg.to_string())
        .finish()
}

/// Text of the first child element named `name`, or `""`.
pub fn child_text<'a>(node: roxmltree::Node<'a, '_>, name: &str) -> &'a str {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
        .and_then(|c| c.text())
        .unwrap_or("")
}

/// Whether a child element named `name` exists at all.
pub fn has_child(node: roxmltree::Node<'_, '_>, name: &str) -> bool {
    node.children()
        .any(|c| c.is_element() && c.tag_name().name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_flat_elements() {
        let msg = MsgBuilder::new("job_trigger_action_wake", "CONSOLE", "00:0c:29:aa:bb:cc")
            .field("macaddress", "00:0c:29:aa:bb:cc")
            .field("timestamp", "20240501091000")
            .finish();
        assert_eq!(
            msg,
            "<xml><header>job_trigger_action_wake</header><source>CONSOLE</source>\
             <target>00:0c:29:aa:bb:cc</target><macaddress>00:0c:29:aa:bb:cc</macaddress>\
             <timestamp>20240501091000</timestamp></xml>"
        );
    }

    #[test]
    fn text_is_escaped() {
        let msg = MsgBuilder::new("h", "a&b", "<t>").finish();
        assert!(msg.contains("a&amp;b"));
        assert!(msg.contains("&lt;t&gt;"));
    }

    #[test]
    fn error_reply_round_trips_through_the_parser() {
        let reply = error_reply("1.2.3.4:20081", &"dial tcp: refused");
        let doc = roxmltree::Document::parse(&reply).unwrap();
        let root = doc.root_element();
        assert_eq!(child_text(root, "error_string"), "dial tcp: refused");
        assert_eq!(child_text(root, "answer1"), "1");
    }
}
