//! vim25 SOAP request construction and response decoding.
//!
//! Request bodies are plain `format!` templates; responses go through the
//! [`Element`] tree. Kept free of I/O so the wire format can be tested
//! directly.

use quick_xml::escape::escape;

use crate::error::{ImportError, ImportResult};
use crate::plane::{DeviceUrl, ImportSpec, MoRef};
use crate::vim::xml::Element;

const NS_SOAPENV: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const NS_XSD: &str = "http://www.w3.org/2001/XMLSchema";
const NS_XSI: &str = "http://www.w3.org/2001/XMLSchema-instance";
pub(crate) const NS_VIM25: &str = "urn:vim25";

/// Wrap a method element in a SOAP envelope.
pub(crate) fn envelope(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="{NS_SOAPENV}" xmlns:xsd="{NS_XSD}" xmlns:xsi="{NS_XSI}">
<soapenv:Body>
{body}
</soapenv:Body>
</soapenv:Envelope>"#
    )
}

/// Build `<Method xmlns="urn:vim25"><_this ...>...</_this>{params}</Method>`.
pub(crate) fn method(name: &str, this: &MoRef, params: &str) -> String {
    format!(
        r#"<{name} xmlns="{NS_VIM25}">{this}{params}</{name}>"#,
        this = moref("_this", this),
    )
}

/// Serialize a managed object reference under the given tag.
pub(crate) fn moref(tag: &str, m: &MoRef) -> String {
    format!(
        r#"<{tag} type="{}">{}</{tag}>"#,
        escape(m.r#type.as_str()),
        escape(m.value.as_str())
    )
}

/// Serialize a text element.
pub(crate) fn text(tag: &str, value: &str) -> String {
    format!("<{tag}>{}</{tag}>", escape(value))
}

/// Parse a managed object reference element.
pub(crate) fn parse_moref(e: &Element) -> ImportResult<MoRef> {
    let ty = e
        .attr("type")
        .ok_or_else(|| ImportError::Protocol(format!("<{}> is not an object reference", e.name)))?;
    Ok(MoRef::new(ty, e.text.trim()))
}

/// Property filter spec for `RetrievePropertiesEx`.
pub(crate) fn property_filter(objs: &[MoRef], r#type: &str, paths: &[&str]) -> String {
    let mut out = String::from("<specSet><propSet>");
    out.push_str(&text("type", r#type));
    for p in paths {
        out.push_str(&text("pathSet", p));
    }
    out.push_str("</propSet>");
    for o in objs {
        out.push_str("<objectSet>");
        out.push_str(&moref("obj", o));
        out.push_str("</objectSet>");
    }
    out.push_str("</specSet><options/>");
    out
}

/// Properties retrieved for one object.
#[derive(Debug, Clone)]
pub(crate) struct ObjectContent {
    pub(crate) obj: MoRef,
    pub(crate) props: Vec<(String, Element)>,
}

impl ObjectContent {
    pub(crate) fn prop(&self, name: &str) -> Option<&Element> {
        self.props.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Decode a `RetrieveResult`; returns the objects and an optional paging token.
pub(crate) fn parse_retrieve_result(
    returnval: &Element,
) -> ImportResult<(Vec<ObjectContent>, Option<String>)> {
    let mut objects = Vec::new();
    for o in returnval.children_named("objects") {
        let obj = o
            .child("obj")
            .ok_or_else(|| ImportError::Protocol("object content without obj".into()))
            .and_then(parse_moref)?;
        let props = o
            .children_named("propSet")
            .filter_map(|p| Some((p.child_text("name")?.to_string(), p.child("val")?.clone())))
            .collect();
        objects.push(ObjectContent { obj, props });
    }
    let token = returnval.child_text("token").map(str::to_string);
    Ok((objects, token))
}

/// Extract the human-readable message of a `LocalizedMethodFault`.
pub(crate) fn localized_fault_message(fault: &Element) -> String {
    if let Some(msg) = fault.child_text("localizedMessage").filter(|m| !m.is_empty()) {
        return msg.to_string();
    }
    if let Some(inner) = fault.child("fault") {
        if let Some(msg) = inner
            .find("message")
            .or_else(|| inner.find("reason"))
            .map(|m| m.text.as_str())
            .filter(|m| !m.is_empty())
        {
            return msg.to_string();
        }
        if let Some(ty) = inner.xsi_type() {
            return ty.to_string();
        }
    }
    "unknown error".to_string()
}

/// A decoded SOAP fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Fault {
    pub(crate) message: String,
    /// Name of the detail element, e.g. `InvalidLoginFault`
    pub(crate) kind: Option<String>,
}

impl Fault {
    /// Map the fault onto the workflow's error taxonomy.
    pub(crate) fn into_error(self, method: &str) -> ImportError {
        let kind = self.kind.as_deref().map(|k| k.trim_end_matches("Fault"));
        match kind {
            Some("InvalidLogin" | "NotAuthenticated" | "NoPermission") => {
                ImportError::Auth(self.message)
            }
            _ => ImportError::Protocol(format!("{method}: {}", self.message)),
        }
    }
}

/// Find a SOAP fault in a response envelope.
pub(crate) fn parse_fault(envelope: &Element) -> Option<Fault> {
    let fault = envelope.path(&["Body", "Fault"])?;
    let message = fault
        .child_text("faultstring")
        .unwrap_or("unknown SOAP fault")
        .to_string();
    let kind = fault
        .child("detail")
        .and_then(|d| d.children.first())
        .map(|d| d.xsi_type().unwrap_or(d.name.as_str()).to_string());
    Some(Fault { message, kind })
}

/// Locate `<MethodResponse>` in a successful envelope.
pub(crate) fn response_body<'a>(envelope: &'a Element, method: &str) -> ImportResult<&'a Element> {
    let expected = format!("{method}Response");
    envelope
        .path(&["Body", expected.as_str()])
        .ok_or_else(|| ImportError::Protocol(format!("{method}: response missing <{expected}>")))
}

/// Decode the `CreateImportSpec` result.
pub(crate) fn parse_import_spec_result(returnval: &Element) -> ImportResult<ImportSpec> {
    let errors: Vec<String> = returnval
        .children_named("error")
        .map(localized_fault_message)
        .collect();
    if !errors.is_empty() {
        return Err(ImportError::InvalidDescriptor(errors.join("; ")));
    }
    let spec = returnval
        .child("importSpec")
        .ok_or_else(|| ImportError::InvalidDescriptor("server returned no import spec".into()))?
        .clone();
    let warnings = returnval
        .children_named("warning")
        .map(localized_fault_message)
        .collect();
    Ok(ImportSpec { spec, warnings })
}

/// Decode an `HttpNfcLeaseInfo`, substituting `host` for a wildcard host.
pub(crate) fn parse_device_urls(info: &Element, host: &str) -> Vec<DeviceUrl> {
    info.children_named("deviceUrl")
        .map(|d| DeviceUrl {
            key: d.child_text("key").unwrap_or_default().to_string(),
            import_key: d.child_text("importKey").unwrap_or_default().to_string(),
            url: d.child_text("url").unwrap_or_default().replace('*', host),
            disk: d.child_text("disk").map(|v| v == "true").unwrap_or(false),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_envelope() {
        let this = MoRef::new("SessionManager", "SessionManager");
        let body = method("Login", &this, &text("userName", "admin@vsphere.local"));
        let env = envelope(&body);
        assert!(env.contains(r#"<Login xmlns="urn:vim25">"#));
        assert!(env.contains(r#"<_this type="SessionManager">SessionManager</_this>"#));
        assert!(env.contains("<userName>admin@vsphere.local</userName>"));
        let parsed = Element::parse(&env).unwrap();
        assert!(parsed.path(&["Body", "Login", "_this"]).is_some());
    }

    #[test]
    fn test_text_escapes_credentials() {
        assert_eq!(text("password", "a<b&c"), "<password>a&lt;b&amp;c</password>");
    }

    #[test]
    fn test_property_filter() {
        let f = property_filter(
            &[MoRef::new("Folder", "group-d1")],
            "Folder",
            &["childEntity"],
        );
        assert_eq!(
            f,
            "<specSet><propSet><type>Folder</type><pathSet>childEntity</pathSet></propSet>\
             <objectSet><obj type=\"Folder\">group-d1</obj></objectSet></specSet><options/>"
        );
    }

    #[test]
    fn test_parse_fault_invalid_login() {
        let xml = r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"
 xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"><soapenv:Body><soapenv:Fault>
<faultcode>ServerFaultCode</faultcode>
<faultstring>Cannot complete login due to an incorrect user name or password.</faultstring>
<detail><InvalidLoginFault xmlns="urn:vim25" xsi:type="InvalidLogin"></InvalidLoginFault></detail>
</soapenv:Fault></soapenv:Body></soapenv:Envelope>"#;
        let env = Element::parse(xml).unwrap();
        let fault = parse_fault(&env).unwrap();
        assert_eq!(fault.kind.as_deref(), Some("InvalidLogin"));
        let err = fault.into_error("Login");
        assert!(matches!(err, ImportError::Auth(m) if m.contains("incorrect user name")));

        let other = Fault {
            message: "boom".into(),
            kind: Some("InvalidArgumentFault".into()),
        };
        assert!(matches!(
            other.into_error("ImportVApp"),
            ImportError::Protocol(m) if m == "ImportVApp: boom"
        ));
    }

    #[test]
    fn test_response_body_missing() {
        let env = Element::parse(
            r#"<Envelope><Body><OtherResponse/></Body></Envelope>"#,
        )
        .unwrap();
        assert!(response_body(&env, "Logout").is_err());
    }

    #[test]
    fn test_retrieve_result_with_token() {
        let rv = Element::parse(
            r#"<returnval><token>1</token><objects><obj type="Datacenter">datacenter-3</obj>
<propSet><name>name</name><val>DC1</val></propSet></objects></returnval>"#,
        )
        .unwrap();
        let (objs, token) = parse_retrieve_result(&rv).unwrap();
        assert_eq!(token.as_deref(), Some("1"));
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].obj, MoRef::new("Datacenter", "datacenter-3"));
        assert_eq!(objs[0].prop("name").unwrap().text, "DC1");
        assert!(objs[0].prop("missing").is_none());
    }

    #[test]
    fn test_import_spec_error_is_invalid_descriptor() {
        let rv = Element::parse(
            r#"<returnval><error><fault xsi:type="OvfXmlFormat"><lineNumber>3</lineNumber></fault>
<localizedMessage>Line 3: Unexpected element.</localizedMessage></error></returnval>"#,
        )
        .unwrap();
        let err = parse_import_spec_result(&rv).unwrap_err();
        assert!(matches!(
            err,
            ImportError::InvalidDescriptor(m) if m == "Line 3: Unexpected element."
        ));
    }

    #[test]
    fn test_import_spec_with_warnings() {
        let rv = Element::parse(
            r#"<returnval><importSpec xsi:type="VirtualMachineImportSpec"><configSpec><name>podvm-base</name></configSpec></importSpec>
<warning><fault xsi:type="OvfUnsupportedElement"/><localizedMessage>Unsupported element 'Caption'</localizedMessage></warning></returnval>"#,
        )
        .unwrap();
        let spec = parse_import_spec_result(&rv).unwrap();
        assert_eq!(spec.spec.xsi_type(), Some("VirtualMachineImportSpec"));
        assert_eq!(spec.warnings, vec!["Unsupported element 'Caption'".to_string()]);
    }

    #[test]
    fn test_localized_fault_falls_back_to_type() {
        let f = Element::parse(r#"<error><fault xsi:type="SystemError"/></error>"#).unwrap();
        assert_eq!(localized_fault_message(&f), "SystemError");
        let f = Element::parse(
            r#"<error><fault xsi:type="SystemError"><reason>NFC connection lost</reason></fault></error>"#,
        )
        .unwrap();
        assert_eq!(localized_fault_message(&f), "NFC connection lost");
    }

    #[test]
    fn test_device_urls_wildcard_host() {
        let info = Element::parse(
            r#"<val xsi:type="HttpNfcLeaseInfo"><lease type="HttpNfcLease">session[1]</lease>
<deviceUrl><key>/vm-42/VirtualLsiLogicController0:0</key><importKey>/podvm-base/VirtualLsiLogicController0:0</importKey>
<url>https://*/nfc/52d1/disk-0.vmdk</url><sslThumbprint>AA:BB</sslThumbprint><disk>true</disk></deviceUrl></val>"#,
        )
        .unwrap();
        let urls = parse_device_urls(&info, "vcenter.example.com");
        assert_eq!(urls.len(), 1);
        assert_eq!(urls[0].url, "https://vcenter.example.com/nfc/52d1/disk-0.vmdk");
        assert!(urls[0].disk);
        assert_eq!(urls[0].import_key, "/podvm-base/VirtualLsiLogicController0:0");
    }
}
