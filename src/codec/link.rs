//! CoRE link format (`application/link-format`, RFC 6690).
//!
//! Used three ways: registration payloads advertising a client's objects,
//! the `</>;rt="oma.lwm2m"` root advertisement, and Discover responses.
//! Tokens are separated by `,`; each token is `<path>` followed by optional
//! `;attr=value` pairs. The recognized attributes are `ct` (integer, only
//! meaningful on the root path, records JSON support) and `rt` (string;
//! the value `oma.lwm2m` on `</>` sets the alternate base path).

use nom::branch::alt;
use nom::bytes::complete::{is_not, tag, take_while1};
use nom::character::complete::{char, multispace0};
use nom::combinator::opt;
use nom::multi::{many0, separated_list0};
use nom::sequence::{delimited, preceded, separated_pair};
use nom::IResult;

use crate::types::{InstanceId, ObjectId, Path};

use super::{ContentType, DecodeError};

/// One `</O>` or `</O/I>` token from a registration payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectListEntry {
    pub object: ObjectId,
    pub instance: Option<InstanceId>,
}

/// A parsed registration object list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectList {
    pub entries: Vec<ObjectListEntry>,
    /// The client advertised `ct=11543` on `</>`.
    pub supports_json: bool,
    /// Alternate base path from `rt="oma.lwm2m"` on a non-root token.
    pub alt_path: Option<String>,
}

fn attribute(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(
        take_while1(|c: char| c.is_ascii_alphanumeric()),
        char('='),
        alt((delimited(char('"'), is_not("\""), char('"')), is_not(";,"))),
    )(input)
}

fn token(input: &str) -> IResult<&str, (&str, Vec<(&str, &str)>)> {
    let (input, _) = multispace0(input)?;
    let (input, path) = delimited(tag("<"), is_not(">"), tag(">"))(input)?;
    let (input, attrs) = many0(preceded(char(';'), attribute))(input)?;
    Ok((input, (path, attrs)))
}

fn link_format(input: &str) -> IResult<&str, Vec<(&str, Vec<(&str, &str)>)>> {
    let (input, tokens) = separated_list0(char(','), token)(input)?;
    let (input, _) = opt(multispace0)(input)?;
    Ok((input, tokens))
}

/// Parse a registration (or update) payload.
///
/// Tokens whose path is not numeric are skipped, as are tokens carrying an
/// unrecognized `rt`; a malformed overall structure is an error.
pub fn parse_object_list(payload: &[u8]) -> Result<ObjectList, DecodeError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| DecodeError::Malformed("link-format payload is not UTF-8".into()))?;

    let (rest, tokens) = link_format(text)
        .map_err(|_| DecodeError::Malformed("unparseable link-format payload".into()))?;
    if !rest.trim().is_empty() {
        return Err(DecodeError::Malformed(format!(
            "trailing bytes in link-format payload: {rest:?}"
        )));
    }

    let mut list = ObjectList::default();
    'tokens: for (path_text, attrs) in tokens {
        let is_root = path_text == "/";
        for (key, value) in &attrs {
            match *key {
                "ct" => {
                    let code: u16 = value.parse().map_err(|_| {
                        DecodeError::Malformed(format!("bad ct attribute {value:?}"))
                    })?;
                    if is_root && code == ContentType::OmaJson.code() {
                        list.supports_json = true;
                    }
                }
                "rt" => {
                    if *value == "oma.lwm2m" {
                        if !is_root {
                            list.alt_path = Some(path_text.to_owned());
                        }
                    } else {
                        // Unknown resource type: not an LWM2M token.
                        continue 'tokens;
                    }
                }
                _ => {}
            }
        }

        if let Ok(path) = path_text.parse::<Path>() {
            if let Some(object) = path.object {
                list.entries.push(ObjectListEntry {
                    object,
                    instance: path.instance,
                });
            }
        }
    }
    Ok(list)
}

/// Render `</path>;attr,…` tokens into one payload.
pub fn write_links<'a>(links: impl IntoIterator<Item = &'a LinkToken>) -> String {
    links
        .into_iter()
        .map(LinkToken::render)
        .collect::<Vec<_>>()
        .join(",")
}

/// An outbound link token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkToken {
    pub path: String,
    pub attributes: Vec<(String, String)>,
}

impl LinkToken {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            attributes: vec![],
        }
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    fn render(&self) -> String {
        let mut out = format!("<{}>", self.path);
        for (key, value) in &self.attributes {
            out.push(';');
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        out
    }
}

/// The root advertisement every registration payload leads with.
pub fn root_advertisement() -> LinkToken {
    LinkToken::new("/")
        .attribute("rt", "\"oma.lwm2m\"")
        .attribute("ct", ContentType::OmaJson.code().to_string())
}
