//! Small XML helpers shared by the event publisher, the subscription
//! validator, and the notification accessors.

use quick_xml::Reader;
use quick_xml::events::Event as XmlEvent;
use std::borrow::Cow;

/// Name of the first element in the fragment, skipping any prolog,
/// comments, or leading text.
pub(crate) fn first_element_name(fragment: &str) -> Option<String> {
    let mut reader = Reader::from_str(fragment);
    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) | Ok(XmlEvent::Empty(e)) => {
                return String::from_utf8(e.local_name().as_ref().to_vec()).ok();
            }
            Ok(XmlEvent::Eof) => return None,
            Ok(_) => {}
            Err(_) => return None,
        }
    }
}

/// Whether the fragment parses as balanced XML. Multiple sibling roots are
/// accepted; subtree filters arrive as bare fragments.
pub(crate) fn is_well_formed(fragment: &str) -> bool {
    if fragment.trim().is_empty() {
        return false;
    }
    let mut reader = Reader::from_str(fragment);
    let mut depth = 0usize;
    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(_)) => depth += 1,
            Ok(XmlEvent::End(_)) => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return false,
            },
            Ok(XmlEvent::Eof) => return depth == 0,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
}

/// Escape text for use as XML character data or an attribute value.
pub(crate) fn escape_text(raw: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_element_name() {
        assert_eq!(first_element_name("<x/>").as_deref(), Some("x"));
        assert_eq!(
            first_element_name("<netconf-config-change><datastore>running</datastore></netconf-config-change>")
                .as_deref(),
            Some("netconf-config-change")
        );
        assert_eq!(
            first_element_name("<?xml version=\"1.0\"?><!-- note --><event attr=\"1\"/>").as_deref(),
            Some("event")
        );
        assert_eq!(first_element_name("plain text"), None);
        assert_eq!(first_element_name(""), None);
    }

    #[test]
    fn test_is_well_formed() {
        assert!(is_well_formed("<a><b/></a>"));
        assert!(is_well_formed("<a/><b/>"));
        assert!(!is_well_formed("<a><b></a>"));
        assert!(!is_well_formed("<a>"));
        assert!(!is_well_formed("</a>"));
        assert!(!is_well_formed("   "));
    }

    #[test]
    fn test_escape_text() {
        assert_eq!(escape_text("a<b>&c"), "a&lt;b&gt;&amp;c");
        assert_eq!(escape_text("plain"), "plain");
    }
}
