//! The XML edge of the IPC surface.
//!
//! Requests arrive as one `<Request Type="…">` document per datagram:
//!
//! ```xml
//!     <Request Type="Set">
//!       <SessionID>1</SessionID>
//!       <Objects>
//!         <Object><ID>3</ID>
//!           <ObjectInstance><ID>0</ID>
//!             <Resource><ID>15</ID><Value>UTC+10</Value></Resource>
//!           </ObjectInstance>
//!         </Object>
//!       </Objects>
//!     </Request>
//! ```
//!
//! Nothing outside this module touches XML; parsing produces the
//! [`IpcRequest`] data model and responses are rendered from
//! [`IpcResponse`].

use quick_xml::events::{BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::types::{Path, ResultCode};

use super::{
    ClientRecord, IpcError, IpcRequest, IpcRequestKind, IpcResponse, ObjectDefinitionSpec,
    ResourceDefinitionSpec, TargetRow,
};

/// A tiny DOM; the IPC schema is small enough to walk by hand.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct XmlNode {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<XmlNode>,
}

impl XmlNode {
    fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|child| child.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |child| child.name == name)
    }

    fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|child| child.text.trim())
    }

    fn child_u16(&self, name: &str) -> Result<u16, IpcError> {
        self.child_text(name)
            .and_then(|text| text.parse().ok())
            .ok_or_else(|| IpcError::Malformed(format!("missing or bad <{name}> in <{}>", self.name)))
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

fn parse_dom(bytes: &[u8]) -> Result<XmlNode, IpcError> {
    let mut reader = Reader::from_reader(bytes);
    reader.trim_text(true);

    let mut stack: Vec<XmlNode> = vec![];
    let mut buf = vec![];
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) => {
                let mut node = XmlNode {
                    name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                    ..Default::default()
                };
                for attribute in start.attributes() {
                    let attribute = attribute.map_err(|err| IpcError::Xml(err.to_string()))?;
                    node.attributes.push((
                        String::from_utf8_lossy(attribute.key.as_ref()).into_owned(),
                        attribute
                            .unescape_value()
                            .map_err(|err| IpcError::Xml(err.to_string()))?
                            .into_owned(),
                    ));
                }
                stack.push(node);
            }
            Ok(Event::Empty(start)) => {
                let node = XmlNode {
                    name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                    ..Default::default()
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => return Ok(node),
                }
            }
            Ok(Event::Text(text)) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(
                        &text
                            .unescape()
                            .map_err(|err| IpcError::Xml(err.to_string()))?,
                    );
                }
            }
            Ok(Event::End(_)) => {
                let node = stack.pop().ok_or_else(|| {
                    IpcError::Xml("close tag without a matching open tag".to_owned())
                })?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => return Ok(node),
                }
            }
            Ok(Event::Eof) => {
                return Err(IpcError::Xml("document ended before the root closed".to_owned()))
            }
            Ok(_) => {}
            Err(err) => return Err(IpcError::Xml(err.to_string())),
        }
        buf.clear();
    }
}

/// Pull `(path, value)` rows out of an `<Objects>` subtree.
fn collect_targets(objects: &XmlNode) -> Result<Vec<TargetRow>, IpcError> {
    let mut rows = vec![];
    for object in objects.children_named("Object") {
        let object_id = object.child_u16("ID")?;
        let mut instances = object.children_named("ObjectInstance").peekable();
        if instances.peek().is_none() {
            rows.push(TargetRow {
                path: Path::object(object_id),
                value: None,
            });
            continue;
        }
        for instance in instances {
            let instance_id = instance.child_u16("ID")?;
            let mut resources = instance.children_named("Resource").peekable();
            if resources.peek().is_none() {
                rows.push(TargetRow {
                    path: Path::instance(object_id, instance_id),
                    value: None,
                });
                continue;
            }
            for resource in resources {
                let resource_id = resource.child_u16("ID")?;
                let mut indices = resource.children_named("ResourceInstance").peekable();
                if indices.peek().is_none() {
                    rows.push(TargetRow {
                        path: Path::resource(object_id, instance_id, resource_id),
                        value: resource.child_text("Value").map(str::to_owned),
                    });
                    continue;
                }
                for index in indices {
                    rows.push(TargetRow {
                        path: Path::resource_instance(
                            object_id,
                            instance_id,
                            resource_id,
                            index.child_u16("ID")?,
                        ),
                        value: index.child_text("Value").map(str::to_owned),
                    });
                }
            }
        }
    }
    Ok(rows)
}

fn parse_object_definition(node: &XmlNode) -> Result<ObjectDefinitionSpec, IpcError> {
    let mut resources = vec![];
    for resource in node.children_named("ResourceDefinition") {
        resources.push(ResourceDefinitionSpec {
            id: resource.child_u16("ID")?,
            name: resource.child_text("Name").unwrap_or_default().to_owned(),
            kind: resource
                .child_text("DataType")
                .unwrap_or("None")
                .parse()
                .map_err(|_| IpcError::Malformed("bad <DataType>".to_owned()))?,
            operations: resource
                .child_text("Operations")
                .unwrap_or("None")
                .parse()
                .map_err(|_| IpcError::Malformed("bad <Operations>".to_owned()))?,
            min_instances: resource.child_u16("MinimumInstances").unwrap_or(0),
            max_instances: resource.child_u16("MaximumInstances").unwrap_or(1),
        });
    }
    Ok(ObjectDefinitionSpec {
        id: node.child_u16("ID")?,
        name: node.child_text("Name").unwrap_or_default().to_owned(),
        min_instances: node.child_u16("MinimumInstances").unwrap_or(0),
        max_instances: node.child_u16("MaximumInstances").unwrap_or(1),
        resources,
    })
}

/// Parse one request datagram.
pub fn parse_request(bytes: &[u8]) -> Result<IpcRequest, IpcError> {
    let root = parse_dom(bytes)?;
    if root.name != "Request" {
        return Err(IpcError::Malformed(format!(
            "expected <Request>, found <{}>",
            root.name
        )));
    }
    let request_type = root
        .attribute("Type")
        .ok_or(IpcError::MissingType)?
        .to_owned();
    let session = root
        .child_text("SessionID")
        .and_then(|text| text.parse().ok());
    let client = root.child_text("Client").map(str::to_owned);

    let targets = match root.child("Objects") {
        Some(objects) => collect_targets(objects)?,
        None => vec![],
    };

    let kind = match request_type.as_str() {
        "Connect" => IpcRequestKind::Connect,
        "Disconnect" => IpcRequestKind::Disconnect,
        "DefineObject" => {
            let definition = root
                .child("ObjectDefinition")
                .or_else(|| root.child("Objects").and_then(|o| o.child("ObjectDefinition")))
                .ok_or_else(|| IpcError::Malformed("missing <ObjectDefinition>".to_owned()))?;
            IpcRequestKind::DefineObject {
                object: parse_object_definition(definition)?,
            }
        }
        "Get" => IpcRequestKind::Get { targets },
        "Set" => IpcRequestKind::Set { targets },
        "Create" => IpcRequestKind::Create { targets },
        "Delete" => IpcRequestKind::Delete { targets },
        "Execute" => {
            let target = targets
                .first()
                .map(|row| row.path)
                .ok_or_else(|| IpcError::Malformed("Execute names no target".to_owned()))?;
            let arguments = root
                .child_text("Arguments")
                .unwrap_or_default()
                .as_bytes()
                .to_vec();
            IpcRequestKind::Execute { target, arguments }
        }
        "Subscribe" | "Observe" => IpcRequestKind::Subscribe { targets },
        "CancelSubscribe" | "CancelObserve" => IpcRequestKind::CancelSubscribe { targets },
        "ListClients" => IpcRequestKind::ListClients,
        other => return Err(IpcError::UnknownType(other.to_owned())),
    };

    Ok(IpcRequest {
        kind,
        session,
        client,
        request_type,
    })
}

type XmlWriter = Writer<Vec<u8>>;

fn write_text_element(
    writer: &mut XmlWriter,
    name: &str,
    text: &str,
) -> quick_xml::Result<()> {
    writer
        .create_element(name)
        .write_text_content(BytesText::new(text))?;
    Ok(())
}

/// Group flat `(path, text)` rows back into an `<Objects>` tree.
fn write_values(writer: &mut XmlWriter, values: &[(Path, String)]) -> quick_xml::Result<()> {
    let mut sorted: Vec<&(Path, String)> = values.iter().collect();
    sorted.sort_by_key(|(path, _)| *path);

    writer.create_element("Objects").write_inner_content(|w| {
        let mut at = 0;
        while at < sorted.len() {
            let object = sorted[at].0.object;
            let object_end = sorted[at..]
                .iter()
                .position(|(path, _)| path.object != object)
                .map(|offset| at + offset)
                .unwrap_or(sorted.len());
            w.create_element("Object").write_inner_content(|w| {
                write_text_element(w, "ID", &object.unwrap_or(0).to_string())?;
                let mut i = at;
                while i < object_end {
                    let instance = sorted[i].0.instance;
                    let instance_end = sorted[i..object_end]
                        .iter()
                        .position(|(path, _)| path.instance != instance)
                        .map(|offset| i + offset)
                        .unwrap_or(object_end);
                    w.create_element("ObjectInstance").write_inner_content(|w| {
                        write_text_element(w, "ID", &instance.unwrap_or(0).to_string())?;
                        for (path, text) in &sorted[i..instance_end] {
                            w.create_element("Resource").write_inner_content(|w| {
                                write_text_element(
                                    w,
                                    "ID",
                                    &path.resource.unwrap_or(0).to_string(),
                                )?;
                                w.create_element("ResourceInstance").write_inner_content(
                                    |w| {
                                        write_text_element(
                                            w,
                                            "ID",
                                            &path.resource_instance.unwrap_or(0).to_string(),
                                        )?;
                                        write_text_element(w, "Value", text)?;
                                        Ok::<(), quick_xml::Error>(())
                                    },
                                )?;
                                Ok::<(), quick_xml::Error>(())
                            })?;
                        }
                        Ok::<(), quick_xml::Error>(())
                    })?;
                    i = instance_end;
                }
                Ok::<(), quick_xml::Error>(())
            })?;
            at = object_end;
        }
        Ok::<(), quick_xml::Error>(())
    })?;
    Ok(())
}

fn write_results(
    writer: &mut XmlWriter,
    results: &[(Path, ResultCode)],
) -> quick_xml::Result<()> {
    writer.create_element("Results").write_inner_content(|w| {
        for (path, code) in results {
            w.create_element("Result").write_inner_content(|w| {
                write_text_element(w, "Path", &path.to_string())?;
                write_text_element(w, "Error", code.name())?;
                Ok::<(), quick_xml::Error>(())
            })?;
        }
        Ok::<(), quick_xml::Error>(())
    })?;
    Ok(())
}

fn write_clients(writer: &mut XmlWriter, clients: &[ClientRecord]) -> quick_xml::Result<()> {
    writer.create_element("Clients").write_inner_content(|w| {
        for client in clients {
            w.create_element("Client").write_inner_content(|w| {
                write_text_element(w, "EndPointName", &client.endpoint_name)?;
                write_text_element(w, "Location", &format!("/rd/{}", client.location))?;
                w.create_element("Objects").write_inner_content(|w| {
                    for path in &client.objects {
                        write_text_element(w, "Path", path)?;
                    }
                    Ok::<(), quick_xml::Error>(())
                })?;
                Ok::<(), quick_xml::Error>(())
            })?;
        }
        Ok::<(), quick_xml::Error>(())
    })?;
    Ok(())
}

/// Render one response datagram.
pub fn write_response(response: &IpcResponse) -> Vec<u8> {
    let mut writer = Writer::new(Vec::new());
    let result = writer
        .create_element("Response")
        .with_attribute(("Type", response.request_type.as_str()))
        .write_inner_content(|w| {
            if let Some(session) = response.session {
                write_text_element(w, "SessionID", &session.to_string())?;
            }
            if !response.values.is_empty() {
                write_values(w, &response.values)?;
            }
            if !response.clients.is_empty() {
                write_clients(w, &response.clients)?;
            }
            write_results(w, &response.results)?;
            Ok::<(), quick_xml::Error>(())
        });
    debug_assert!(result.is_ok(), "writing to a Vec cannot fail");
    writer.into_inner()
}

/// Render a change notification for a subscribed session.
pub fn write_notification(session: u32, path: &Path, value_text: &str) -> Vec<u8> {
    let mut writer = Writer::new(Vec::new());
    let result = writer
        .create_element("Notification")
        .with_attribute(("Type", "Changed"))
        .write_inner_content(|w| {
            write_text_element(w, "SessionID", &session.to_string())?;
            write_text_element(w, "Path", &path.to_string())?;
            write_text_element(w, "Value", value_text)?;
            Ok::<(), quick_xml::Error>(())
        });
    debug_assert!(result.is_ok(), "writing to a Vec cannot fail");
    writer.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Operations;
    use crate::value::ResourceKind;

    #[test]
    fn connect_request_parses() {
        let request = parse_request(b"<Request Type=\"Connect\"/>").unwrap();
        assert_eq!(request.kind, IpcRequestKind::Connect);
        assert_eq!(request.session, None);
    }

    #[test]
    fn set_request_parses_paths_and_values() {
        let request = parse_request(
            b"<Request Type=\"Set\">\
                <SessionID>1</SessionID>\
                <Objects>\
                  <Object><ID>3</ID>\
                    <ObjectInstance><ID>0</ID>\
                      <Resource><ID>15</ID><Value>UTC+10</Value></Resource>\
                      <Resource><ID>6</ID>\
                        <ResourceInstance><ID>2</ID><Value>5</Value></ResourceInstance>\
                      </Resource>\
                    </ObjectInstance>\
                  </Object>\
                </Objects>\
              </Request>",
        )
        .unwrap();

        assert_eq!(request.session, Some(1));
        let IpcRequestKind::Set { targets } = request.kind else {
            panic!("expected Set");
        };
        assert_eq!(
            targets,
            vec![
                TargetRow {
                    path: Path::resource(3, 0, 15),
                    value: Some("UTC+10".to_owned()),
                },
                TargetRow {
                    path: Path::resource_instance(3, 0, 6, 2),
                    value: Some("5".to_owned()),
                },
            ]
        );
    }

    #[test]
    fn shallow_paths_parse_without_values() {
        let request = parse_request(
            b"<Request Type=\"Get\"><SessionID>1</SessionID><Objects>\
                <Object><ID>3</ID></Object>\
                <Object><ID>4</ID><ObjectInstance><ID>0</ID></ObjectInstance></Object>\
              </Objects></Request>",
        )
        .unwrap();
        let IpcRequestKind::Get { targets } = request.kind else {
            panic!("expected Get");
        };
        assert_eq!(targets[0].path, Path::object(3));
        assert_eq!(targets[1].path, Path::instance(4, 0));
    }

    #[test]
    fn define_object_parses_the_schema() {
        let request = parse_request(
            b"<Request Type=\"DefineObject\"><SessionID>1</SessionID>\
                <ObjectDefinition>\
                  <ID>10000</ID><Name>Widget</Name>\
                  <MinimumInstances>0</MinimumInstances><MaximumInstances>2</MaximumInstances>\
                  <ResourceDefinition>\
                    <ID>0</ID><Name>Counter</Name><DataType>Integer</DataType>\
                    <Operations>RW</Operations>\
                    <MinimumInstances>1</MinimumInstances><MaximumInstances>1</MaximumInstances>\
                  </ResourceDefinition>\
                </ObjectDefinition>\
              </Request>",
        )
        .unwrap();

        let IpcRequestKind::DefineObject { object } = request.kind else {
            panic!("expected DefineObject");
        };
        assert_eq!(object.id, 10000);
        assert_eq!(object.max_instances, 2);
        assert_eq!(object.resources.len(), 1);
        assert_eq!(object.resources[0].kind, ResourceKind::Integer);
        assert_eq!(object.resources[0].operations, Operations::ReadWrite);
    }

    #[test]
    fn execute_carries_arguments() {
        let request = parse_request(
            b"<Request Type=\"Execute\"><SessionID>1</SessionID>\
                <Objects><Object><ID>3</ID><ObjectInstance><ID>0</ID>\
                  <Resource><ID>4</ID></Resource>\
                </ObjectInstance></Object></Objects>\
                <Arguments>now</Arguments>\
              </Request>",
        )
        .unwrap();
        assert_eq!(
            request.kind,
            IpcRequestKind::Execute {
                target: Path::resource(3, 0, 4),
                arguments: b"now".to_vec(),
            }
        );
    }

    #[test]
    fn server_role_requests_name_their_client() {
        let request = parse_request(
            b"<Request Type=\"Get\"><SessionID>1</SessionID><Client>client1</Client>\
                <Objects><Object><ID>3</ID><ObjectInstance><ID>0</ID>\
                  <Resource><ID>9</ID></Resource>\
                </ObjectInstance></Object></Objects>\
              </Request>",
        )
        .unwrap();
        assert_eq!(request.client.as_deref(), Some("client1"));
    }

    #[test]
    fn malformed_requests_are_rejected() {
        assert!(matches!(
            parse_request(b"<Request Type=\"Warp\"/>"),
            Err(IpcError::UnknownType(_))
        ));
        assert!(matches!(
            parse_request(b"<Request/>"),
            Err(IpcError::MissingType)
        ));
        assert!(matches!(
            parse_request(b"<Response Type=\"Get\"/>"),
            Err(IpcError::Malformed(_))
        ));
        assert!(matches!(
            parse_request(b"<Request Type=\"Get\"><Objects>"),
            Err(IpcError::Xml(_))
        ));
    }

    #[test]
    fn responses_carry_per_path_errors() {
        let response = IpcResponse {
            request_type: "Set".to_owned(),
            session: Some(1),
            results: vec![
                (Path::resource(3, 0, 15), ResultCode::SuccessChanged),
                (Path::resource(3, 0, 77), ResultCode::NotFound),
            ],
            values: vec![],
            clients: vec![],
        };
        let text = String::from_utf8(write_response(&response)).unwrap();
        assert!(text.starts_with("<Response Type=\"Set\">"), "{text}");
        assert!(text.contains("<SessionID>1</SessionID>"), "{text}");
        assert!(text.contains("<Path>/3/0/15</Path><Error>SuccessChanged</Error>"), "{text}");
        assert!(text.contains("<Path>/3/0/77</Path><Error>NotFound</Error>"), "{text}");
    }

    #[test]
    fn get_responses_nest_values() {
        let response = IpcResponse {
            request_type: "Get".to_owned(),
            session: Some(1),
            results: vec![(Path::instance(3, 0), ResultCode::Success)],
            values: vec![
                (Path::resource_instance(3, 0, 9, 0), "55".to_owned()),
                (Path::resource_instance(3, 0, 15, 0), "UTC".to_owned()),
            ],
            clients: vec![],
        };
        let text = String::from_utf8(write_response(&response)).unwrap();
        assert_eq!(text.matches("<Object>").count(), 1, "{text}");
        assert_eq!(text.matches("<ObjectInstance>").count(), 1, "{text}");
        assert!(text.contains("<Value>55</Value>"), "{text}");
        assert!(text.contains("<Value>UTC</Value>"), "{text}");
    }

    #[test]
    fn notifications_render() {
        let text =
            String::from_utf8(write_notification(7, &Path::resource(3, 0, 13), "1467299340"))
                .unwrap();
        assert!(text.contains("<SessionID>7</SessionID>"), "{text}");
        assert!(text.contains("<Path>/3/0/13</Path>"), "{text}");
        assert!(text.contains("<Value>1467299340</Value>"), "{text}");
    }

    #[test]
    fn round_trip_request_values_unescape() {
        let request = parse_request(
            b"<Request Type=\"Set\"><SessionID>1</SessionID><Objects>\
                <Object><ID>3</ID><ObjectInstance><ID>0</ID>\
                  <Resource><ID>15</ID><Value>a &amp; b</Value></Resource>\
                </ObjectInstance></Object></Objects></Request>",
        )
        .unwrap();
        let IpcRequestKind::Set { targets } = request.kind else {
            panic!("expected Set");
        };
        assert_eq!(targets[0].value.as_deref(), Some("a & b"));
    }
}
