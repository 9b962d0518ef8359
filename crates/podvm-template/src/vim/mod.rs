//! vim25 SOAP client for vCenter / ESXi.
//!
//! Talks to `https://{host}:{port}/sdk`. The session is tracked by the
//! `vmware_soap_session` cookie, so the underlying HTTP client keeps a
//! cookie store. Only the handful of methods the import workflow needs are
//! implemented.

pub(crate) mod soap;
pub mod xml;

use std::collections::HashMap;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use tracing::{debug, trace};

use crate::error::{ImportError, ImportResult, InventoryKind};
use crate::inventory::InventoryItem;
use crate::plane::{DeviceUrl, ImportSpec, LeaseStatus, ManagementPlane, MoRef};
use crate::session::ConnectionConfig;
use soap::{moref, text};
use xml::Element;

/// API version sent before the server has told us what it speaks.
const BOOTSTRAP_API_VERSION: &str = "6.7";

/// Root references from `RetrieveServiceContent`.
#[derive(Debug, Clone)]
struct ServiceContent {
    root_folder: MoRef,
    property_collector: MoRef,
    session_manager: MoRef,
    ovf_manager: MoRef,
    api_version: String,
}

/// A connected (not necessarily logged in) vim25 client.
#[derive(Debug)]
pub struct VimClient {
    client: Client,
    sdk_url: String,
    host: String,
    content: ServiceContent,
    lease_call_timeout: Duration,
}

impl VimClient {
    /// Connect to the endpoint and fetch the service content.
    pub fn connect(config: &ConnectionConfig) -> ImportResult<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(!config.verify_ssl)
            .timeout(config.timeout)
            .build()
            .map_err(|e| ImportError::Network(format!("failed to build HTTP client: {e}")))?;
        let sdk_url = format!("https://{}:{}/sdk", config.host, config.port);

        debug!("Retrieving service content from {sdk_url}");
        let this = MoRef::new("ServiceInstance", "ServiceInstance");
        let body = soap::method("RetrieveServiceContent", &this, "");
        let env = post(&client, &sdk_url, BOOTSTRAP_API_VERSION, &body, None)?;
        let rv = returnval(&env, "RetrieveServiceContent")?;
        let content = parse_service_content(rv)?;
        debug!("Server speaks vim25 API {}", content.api_version);

        Ok(Self {
            client,
            sdk_url,
            host: config.host.clone(),
            content,
            lease_call_timeout: config.lease_call_timeout,
        })
    }

    /// Authenticate the session.
    pub fn login(&self, user: &str, password: &str) -> ImportResult<()> {
        let params = format!("{}{}", text("userName", user), text("password", password));
        self.invoke("Login", &self.content.session_manager, &params)?;
        debug!("Logged in as {user}");
        Ok(())
    }

    fn invoke(&self, method: &str, this: &MoRef, params: &str) -> ImportResult<Element> {
        self.invoke_with_timeout(method, this, params, None)
    }

    fn invoke_with_timeout(
        &self,
        method: &str,
        this: &MoRef,
        params: &str,
        timeout: Option<Duration>,
    ) -> ImportResult<Element> {
        let body = soap::method(method, this, params);
        let env = post(
            &self.client,
            &self.sdk_url,
            &self.content.api_version,
            &body,
            timeout,
        )?;
        let resp = soap::response_body(&env, method)?.clone();
        Ok(resp)
    }

    fn invoke_returnval(&self, method: &str, this: &MoRef, params: &str) -> ImportResult<Element> {
        let resp = self.invoke(method, this, params)?;
        resp.child("returnval")
            .cloned()
            .ok_or_else(|| ImportError::Protocol(format!("{method}: response without returnval")))
    }

    /// `RetrievePropertiesEx`, following paging tokens.
    fn retrieve(
        &self,
        objs: &[MoRef],
        r#type: &str,
        paths: &[&str],
        timeout: Option<Duration>,
    ) -> ImportResult<Vec<soap::ObjectContent>> {
        let pc = &self.content.property_collector;
        let resp = self.invoke_with_timeout(
            "RetrievePropertiesEx",
            pc,
            &soap::property_filter(objs, r#type, paths),
            timeout,
        )?;
        // An empty result has no returnval at all
        let Some(rv) = resp.child("returnval") else {
            return Ok(Vec::new());
        };
        let (mut objects, mut token) = soap::parse_retrieve_result(rv)?;
        while let Some(t) = token.take() {
            trace!("Continuing property retrieval with token {t}");
            let resp = self.invoke_with_timeout(
                "ContinueRetrievePropertiesEx",
                pc,
                &text("token", &t),
                timeout,
            )?;
            let rv = resp.child("returnval").ok_or_else(|| {
                ImportError::Protocol(
                    "ContinueRetrievePropertiesEx: response without returnval".into(),
                )
            })?;
            let (more, next) = soap::parse_retrieve_result(rv)?;
            objects.extend(more);
            token = next;
        }
        Ok(objects)
    }

    fn retrieve_one(
        &self,
        obj: &MoRef,
        paths: &[&str],
        timeout: Option<Duration>,
    ) -> ImportResult<soap::ObjectContent> {
        self.retrieve(std::slice::from_ref(obj), &obj.r#type, paths, timeout)?
            .into_iter()
            .next()
            .ok_or_else(|| ImportError::Protocol(format!("no properties returned for {obj}")))
    }
}

impl ManagementPlane for VimClient {
    fn host(&self) -> &str {
        &self.host
    }

    fn root_folder(&self) -> &MoRef {
        &self.content.root_folder
    }

    fn child_entities(
        &self,
        folder: &MoRef,
        kind: InventoryKind,
    ) -> ImportResult<Vec<InventoryItem>> {
        let content = self.retrieve_one(folder, &["childEntity"], None)?;
        let children = match content.prop("childEntity") {
            Some(val) => val
                .children_named("ManagedObjectReference")
                .map(soap::parse_moref)
                .collect::<ImportResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        if children.is_empty() {
            return Ok(Vec::new());
        }

        let names: HashMap<MoRef, String> = self
            .retrieve(&children, "ManagedEntity", &["name"], None)?
            .into_iter()
            .filter_map(|o| {
                let name = o.prop("name")?.text.clone();
                Some((o.obj, name))
            })
            .collect();

        // Keep the server's child order; it decides which item is the default
        children
            .into_iter()
            .map(|m| {
                let name = names
                    .get(&m)
                    .cloned()
                    .ok_or_else(|| ImportError::Protocol(format!("no name returned for {m}")))?;
                Ok(InventoryItem::new(kind, name, m))
            })
            .collect()
    }

    fn property_ref(&self, obj: &MoRef, property: &str) -> ImportResult<MoRef> {
        let content = self.retrieve_one(obj, &[property], None)?;
        let val = content
            .prop(property)
            .ok_or_else(|| ImportError::Protocol(format!("{obj} has no {property}")))?;
        soap::parse_moref(val)
    }

    fn create_import_spec(
        &self,
        descriptor: &str,
        resource_pool: &MoRef,
        datastore: &MoRef,
        entity_name: &str,
    ) -> ImportResult<ImportSpec> {
        let params = format!(
            "{}{}{}<cisp>{}{}{}</cisp>",
            text("ovfDescriptor", descriptor),
            moref("resourcePool", resource_pool),
            moref("datastore", datastore),
            text("locale", ""),
            text("deploymentOption", ""),
            text("entityName", entity_name),
        );
        let rv = self.invoke_returnval("CreateImportSpec", &self.content.ovf_manager, &params)?;
        soap::parse_import_spec_result(&rv)
    }

    fn import_vapp(
        &self,
        spec: &ImportSpec,
        resource_pool: &MoRef,
        folder: &MoRef,
    ) -> ImportResult<MoRef> {
        let mut params = String::new();
        spec.spec.write_as("spec", &[], &mut params);
        params.push_str(&moref("folder", folder));
        let rv = self.invoke_returnval("ImportVApp", resource_pool, &params)?;
        soap::parse_moref(&rv)
    }

    fn lease_status(&self, lease: &MoRef) -> ImportResult<LeaseStatus> {
        let content =
            self.retrieve_one(lease, &["state", "error"], Some(self.lease_call_timeout))?;
        let state = content
            .prop("state")
            .map(|v| v.text.as_str())
            .ok_or_else(|| ImportError::Protocol(format!("{lease} has no state")))?;
        match state {
            "initializing" => Ok(LeaseStatus::Initializing),
            "ready" => Ok(LeaseStatus::Ready),
            "done" => Ok(LeaseStatus::Done),
            "error" => {
                let detail = content
                    .prop("error")
                    .map(soap::localized_fault_message)
                    .unwrap_or_else(|| "unknown lease error".to_string());
                Ok(LeaseStatus::Error(detail))
            }
            other => Err(ImportError::Protocol(format!(
                "unknown lease state '{other}'"
            ))),
        }
    }

    fn lease_device_urls(&self, lease: &MoRef) -> ImportResult<Vec<DeviceUrl>> {
        let content = self.retrieve_one(lease, &["info"], None)?;
        let info = content
            .prop("info")
            .ok_or_else(|| ImportError::Protocol(format!("{lease} has no info")))?;
        Ok(soap::parse_device_urls(info, &self.host))
    }

    fn lease_progress(&self, lease: &MoRef, percent: u8) -> ImportResult<()> {
        self.invoke_with_timeout(
            "HttpNfcLeaseProgress",
            lease,
            &text("percent", &percent.to_string()),
            Some(self.lease_call_timeout),
        )?;
        Ok(())
    }

    fn lease_complete(&self, lease: &MoRef) -> ImportResult<()> {
        self.invoke("HttpNfcLeaseComplete", lease, "")?;
        Ok(())
    }

    fn lease_abort(&self, lease: &MoRef, reason: &str) -> ImportResult<()> {
        let fault = format!(
            r#"<fault><fault xsi:type="SystemError">{}</fault>{}</fault>"#,
            text("reason", reason),
            text("localizedMessage", reason),
        );
        self.invoke("HttpNfcLeaseAbort", lease, &fault)?;
        Ok(())
    }

    fn logout(&self) -> ImportResult<()> {
        self.invoke("Logout", &self.content.session_manager, "")?;
        Ok(())
    }
}

/// POST one SOAP request and return the parsed envelope.
///
/// SOAP faults come back as HTTP 500 with a `Fault` body and are mapped to
/// [`ImportError`] here.
fn post(
    client: &Client,
    url: &str,
    api_version: &str,
    body: &str,
    timeout: Option<Duration>,
) -> ImportResult<Element> {
    let mut req = client
        .post(url)
        .header("Content-Type", "text/xml; charset=utf-8")
        .header("SOAPAction", format!("urn:vim25/{api_version}"))
        .body(soap::envelope(body));
    if let Some(t) = timeout {
        req = req.timeout(t);
    }
    let resp = req
        .send()
        .map_err(|e| ImportError::Network(format!("{url}: {e}")))?;
    let status = resp.status();
    let text = resp
        .text()
        .map_err(|e| ImportError::Network(format!("reading response from {url}: {e}")))?;

    let method = body
        .trim_start_matches('<')
        .split([' ', '>'])
        .next()
        .unwrap_or("request");
    if status.is_success() || status == StatusCode::INTERNAL_SERVER_ERROR {
        let env = Element::parse(&text)?;
        if let Some(fault) = soap::parse_fault(&env) {
            return Err(fault.into_error(method));
        }
        if status.is_success() {
            return Ok(env);
        }
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ImportError::Auth(format!(
            "{method}: HTTP {status}"
        ))),
        _ => Err(ImportError::Protocol(format!(
            "{method}: HTTP {status}: {}",
            text.chars().take(500).collect::<String>()
        ))),
    }
}

fn returnval<'a>(env: &'a Element, method: &str) -> ImportResult<&'a Element> {
    soap::response_body(env, method)?
        .child("returnval")
        .ok_or_else(|| ImportError::Protocol(format!("{method}: response without returnval")))
}

fn parse_service_content(rv: &Element) -> ImportResult<ServiceContent> {
    let get = |name: &str| -> ImportResult<MoRef> {
        let e = rv
            .child(name)
            .ok_or_else(|| ImportError::Protocol(format!("service content missing {name}")))?;
        soap::parse_moref(e)
    };
    Ok(ServiceContent {
        root_folder: get("rootFolder")?,
        property_collector: get("propertyCollector")?,
        session_manager: get("sessionManager")?,
        ovf_manager: get("ovfManager")?,
        api_version: rv
            .path(&["about", "apiVersion"])
            .map(|e| e.text.clone())
            .unwrap_or_else(|| BOOTSTRAP_API_VERSION.to_string()),
    })
}
