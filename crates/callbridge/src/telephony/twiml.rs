//! Call-instruction document builder.
//!
//! Both carriers fetch an XML document on pickup that tells them what to do
//! with the call; both speak the same TwiML-shaped dialect. The only
//! document this bridge serves connects a bidirectional media stream, but
//! the builder keeps the elements composable.

use std::fmt::Write;

/// Builder for carrier call-instruction XML.
#[derive(Debug, Clone, Default)]
pub struct InstructionBuilder {
    elements: Vec<Element>,
}

#[derive(Debug, Clone)]
enum Element {
    /// `<Connect><Stream url="..."/></Connect>` — bidirectional audio.
    ConnectStream { url: String },
    Pause { length: u32 },
    Hangup,
}

impl InstructionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directs the carrier to open a bidirectional media WebSocket.
    pub fn connect_stream(mut self, url: &str) -> Self {
        self.elements.push(Element::ConnectStream {
            url: xml_escape(url),
        });
        self
    }

    pub fn pause(mut self, seconds: u32) -> Self {
        self.elements.push(Element::Pause { length: seconds });
        self
    }

    pub fn hangup(mut self) -> Self {
        self.elements.push(Element::Hangup);
        self
    }

    /// Renders the XML document.
    pub fn build(self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response>\n");
        for element in self.elements {
            match element {
                Element::ConnectStream { url } => {
                    let _ = writeln!(
                        xml,
                        "  <Connect>\n    <Stream url=\"{url}\"/>\n  </Connect>"
                    );
                }
                Element::Pause { length } => {
                    let _ = writeln!(xml, "  <Pause length=\"{length}\"/>");
                }
                Element::Hangup => {
                    let _ = writeln!(xml, "  <Hangup/>");
                }
            }
        }
        xml.push_str("</Response>");
        xml
    }

    /// The standard instruction: stream media to `media_ws_url`, holding
    /// the call open while the stream runs.
    pub fn media_stream(media_ws_url: &str) -> String {
        InstructionBuilder::new()
            .connect_stream(media_ws_url)
            .pause(120)
            .build()
    }

    /// An instruction that immediately ends the call; served when no call
    /// is expecting media.
    pub fn reject() -> String {
        InstructionBuilder::new().hangup().build()
    }
}

/// Escapes XML-special characters.
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
