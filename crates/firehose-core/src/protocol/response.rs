//! Decoded `<response>` frames and ACK/NAK classification.

use super::xml::{Element, scan_elements};

/// One decoded `<response>` element: the primary `value` plus whatever named
/// attributes the loader attached (`SectorSizeInBytes`, `rawmode`, `Digest`,
/// ...). Transient; one per exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolResponse {
    pub value: Option<String>,
    pub attrs: Vec<(String, String)>,
}

/// Classification of a response's primary value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    /// `ACK`/`true`, or a NAK that also carries `rawmode="true"`. Some
    /// loaders NAK the trailing control packet of a bulk transfer while
    /// still having accepted the data.
    Acked,
    /// Explicit `NAK`/`false`.
    Nacked,
    /// Any other non-empty value: query-style payload data.
    Data(String),
    /// No `value` attribute at all: more frames are pending, not success.
    Pending,
}

impl ProtocolResponse {
    pub fn from_element(elem: &Element) -> Self {
        Self {
            value: elem.attr("value").map(str::to_string),
            attrs: elem.attrs.clone(),
        }
    }

    /// Case-insensitive attribute lookup.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether this response announces the switch to binary payload.
    pub fn rawmode(&self) -> bool {
        self.attr("rawmode")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn status(&self) -> CommandStatus {
        match self.value.as_deref() {
            None | Some("") => CommandStatus::Pending,
            Some(v) if v.eq_ignore_ascii_case("ACK") || v.eq_ignore_ascii_case("true") => {
                CommandStatus::Acked
            }
            Some(v) if v.eq_ignore_ascii_case("NAK") || v.eq_ignore_ascii_case("false") => {
                if self.rawmode() {
                    CommandStatus::Acked
                } else {
                    CommandStatus::Nacked
                }
            }
            Some(v) => CommandStatus::Data(v.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == CommandStatus::Acked
    }
}

/// A framed packet split into its response (if any) and its `<log>` lines.
#[derive(Debug, Default)]
pub struct ParsedPacket {
    pub response: Option<ProtocolResponse>,
    pub logs: Vec<String>,
}

/// Decode one framed packet. `<log>` elements are collected in order and
/// never mistaken for responses; the first `<response>` wins.
pub fn parse_packet(packet: &str) -> ParsedPacket {
    let mut parsed = ParsedPacket::default();
    for elem in scan_elements(packet) {
        if elem.name.eq_ignore_ascii_case("log") {
            if let Some(msg) = elem.attr("value") {
                if !msg.trim().is_empty() {
                    parsed.logs.push(msg.to_string());
                }
            }
        } else if elem.name.eq_ignore_ascii_case("response") && parsed.response.is_none() {
            parsed.response = Some(ProtocolResponse::from_element(&elem));
        }
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(inner: &str) -> ProtocolResponse {
        parse_packet(&format!("<data>{inner}</data>"))
            .response
            .expect("packet should contain a response")
    }

    #[test]
    fn test_ack_variants() {
        assert_eq!(
            response("<response value=\"ACK\"/>").status(),
            CommandStatus::Acked
        );
        assert_eq!(
            response("<response value=\"true\"/>").status(),
            CommandStatus::Acked
        );
        assert_eq!(
            response("<response value=\"ack\"/>").status(),
            CommandStatus::Acked
        );
    }

    #[test]
    fn test_nak_is_failure() {
        assert_eq!(
            response("<response value=\"NAK\"/>").status(),
            CommandStatus::Nacked
        );
        assert_eq!(
            response("<response value=\"false\"/>").status(),
            CommandStatus::Nacked
        );
    }

    #[test]
    fn test_nak_with_rawmode_is_success() {
        assert_eq!(
            response("<response value=\"NAK\" rawmode=\"true\"/>").status(),
            CommandStatus::Acked
        );
    }

    #[test]
    fn test_absent_value_is_pending() {
        assert_eq!(
            response("<response Digest=\"AABB\"/>").status(),
            CommandStatus::Pending
        );
    }

    #[test]
    fn test_other_value_is_data() {
        assert_eq!(
            response("<response value=\"0xDEADBEEF\"/>").status(),
            CommandStatus::Data("0xDEADBEEF".into())
        );
    }

    #[test]
    fn test_logs_never_mistaken_for_response() {
        let parsed = parse_packet(
            "<data><log value=\"INFO: start\"/><log value=\"INFO: end\"/></data>",
        );
        assert!(parsed.response.is_none());
        assert_eq!(parsed.logs, vec!["INFO: start", "INFO: end"]);
    }

    #[test]
    fn test_response_attributes() {
        let resp = response(
            "<response value=\"ACK\" SectorSizeInBytes=\"4096\" \
             MaxPayloadSizeToTargetInBytes=\"1048576\"/>",
        );
        assert_eq!(resp.attr("SectorSizeInBytes"), Some("4096"));
        assert_eq!(resp.attr("maxpayloadsizetotargetinbytes"), Some("1048576"));
        assert!(!resp.rawmode());
    }
}
